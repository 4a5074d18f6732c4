use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// External listen port
pub const PORT_ENV: &str = "PORT";
/// Directory the backend keeps its state in (and where `config.json` is written)
pub const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";
/// Shared auth token for the backend
pub const TOKEN_ENV: &str = "OPENCLAW_GATEWAY_TOKEN";
/// Model provider key copied into the generated backend config
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
/// Full backend command line, parsed with shell quoting rules
pub const COMMAND_ENV: &str = "GATEWAY_COMMAND";

/// State directory used when `OPENCLAW_STATE_DIR` is unset
pub const DEFAULT_STATE_DIR: &str = "/home/node/.openclaw";

/// Errors raised while assembling the wrapper configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid GATEWAY_COMMAND: {0}")]
    InvalidCommand(String),
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Top-level wrapper configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Frontend listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// How the backend is launched and supervised
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// External port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum time to wait for the backend's response head (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle pooled connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle pooled connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch (default: node)
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments placed before the fixed gateway flags
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Loopback port the backend is told to listen on (default: 18789)
    #[serde(default = "default_internal_port")]
    pub port: u16,

    /// State directory exported to the backend
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Auth token; generated at startup when absent
    pub token: Option<String>,

    /// Model provider API key written into `config.json`
    pub api_key: Option<String>,

    /// Substring in a stdout line that marks the backend as ready
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Bound on how long a request waits for readiness (default: 30000)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL at shutdown (default: 10)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            port: default_internal_port(),
            state_dir: default_state_dir(),
            token: None,
            api_key: None,
            ready_marker: default_ready_marker(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            env: HashMap::new(),
        }
    }
}

impl BackendConfig {
    /// Create a config for an arbitrary command listening on `port`
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// The token shared with the backend, generating one on first use
    pub fn resolve_token(&mut self) -> &str {
        self.token.get_or_insert_with(generate_token)
    }

    /// Full argument list passed to the backend executable
    pub fn launch_args(&self, token: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--bind".to_string(),
            "loopback".to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--token".to_string(),
            token.to_string(),
            "--allow-unconfigured".to_string(),
        ]);
        args
    }

    /// Address every proxied request is sent to
    pub fn target_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("backend command must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("backend port must be non-zero".to_string());
        }
        if self.ready_marker.is_empty() {
            return Err("ready_marker must not be empty".to_string());
        }
        if matches!(&self.token, Some(t) if t.is_empty()) {
            return Err("token must not be empty when set".to_string());
        }
        Ok(())
    }
}

/// A 32 character lowercase hex token
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_command() -> String {
    "node".to_string()
}

fn default_args() -> Vec<String> {
    vec!["dist/index.js".to_string(), "gateway".to_string()]
}

fn default_internal_port() -> u16 {
    18789
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_ready_marker() -> String {
    "listening on".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    /// Load a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: PORT_ENV,
                value: port.clone(),
            })?;
        }

        if let Some(dir) = lookup(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.backend.state_dir = PathBuf::from(dir);
        }

        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.backend.token = Some(token);
        }

        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.is_empty()) {
            self.backend.api_key = Some(key);
        }

        if let Some(line) = lookup(COMMAND_ENV) {
            let mut words = shell_words::split(&line)
                .map_err(|e| ConfigError::InvalidCommand(e.to_string()))?;
            if words.is_empty() {
                return Err(ConfigError::InvalidCommand("empty command".to_string()));
            }
            self.backend.command = words.remove(0);
            self.backend.args = words;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend.validate() {
            errors.push(e);
        }

        if self.server.port != 0 && self.server.port == self.backend.port {
            errors.push(format!(
                "external port {} collides with the backend port",
                self.server.port
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.backend.command, "node");
        assert_eq!(config.backend.args, vec!["dist/index.js", "gateway"]);
        assert_eq!(config.backend.port, 18789);
        assert_eq!(config.backend.ready_marker, "listening on");
        assert_eq!(config.backend.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.backend.state_dir, PathBuf::from("/home/node/.openclaw"));
        assert!(config.backend.token.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"

[backend]
command = "bun"
args = ["run", "gateway.ts"]
port = 19000
state_dir = "/var/lib/gateway"
startup_timeout_ms = 5000

[backend.env]
NODE_ENV = "production"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.backend.command, "bun");
        assert_eq!(config.backend.port, 19000);
        assert_eq!(config.backend.state_dir, PathBuf::from("/var/lib/gateway"));
        assert_eq!(config.backend.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.backend.env.get("NODE_ENV").unwrap(), "production");
        // Unset fields keep their defaults
        assert_eq!(config.backend.ready_marker, "listening on");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[
                ("PORT", "3000"),
                ("OPENCLAW_STATE_DIR", "/tmp/state"),
                ("OPENCLAW_GATEWAY_TOKEN", "abc123"),
                ("OPENROUTER_API_KEY", "sk-or-test"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.backend.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.backend.token.as_deref(), Some("abc123"));
        assert_eq!(config.backend.api_key.as_deref(), Some("sk-or-test"));
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = Config::default();
        let err = config.apply_env_from(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "PORT", .. }));
    }

    #[test]
    fn test_empty_token_env_is_ignored() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[("OPENCLAW_GATEWAY_TOKEN", "")]))
            .unwrap();
        assert!(config.backend.token.is_none());
    }

    #[test]
    fn test_gateway_command_override() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[("GATEWAY_COMMAND", "node 'dist/my index.js' gateway")]))
            .unwrap();
        assert_eq!(config.backend.command, "node");
        assert_eq!(config.backend.args, vec!["dist/my index.js", "gateway"]);

        let err = config
            .apply_env_from(env(&[("GATEWAY_COMMAND", "   ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCommand(_)));
    }

    #[test]
    fn test_launch_args() {
        let backend = BackendConfig::default();
        assert_eq!(
            backend.launch_args("tok"),
            vec![
                "dist/index.js",
                "gateway",
                "--bind",
                "loopback",
                "--port",
                "18789",
                "--token",
                "tok",
                "--allow-unconfigured",
            ]
        );
        assert_eq!(backend.target_addr(), "127.0.0.1:18789");
    }

    #[test]
    fn test_resolve_token_is_stable() {
        let mut backend = BackendConfig::default();
        let first = backend.resolve_token().to_string();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(backend.resolve_token(), first);

        let mut fixed = BackendConfig::default().with_token("given");
        assert_eq!(fixed.resolve_token(), "given");
    }

    #[test]
    fn test_validate_rejects_port_collision() {
        let mut config = Config::default();
        config.server.port = config.backend.port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_validate_rejects_empty_marker() {
        let mut backend = BackendConfig::default();
        backend.ready_marker.clear();
        assert!(backend.validate().is_err());
    }
}
