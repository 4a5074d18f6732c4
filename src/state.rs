//! The backend's `config.json`, written once at startup and never read back

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Model the backend uses unless told otherwise
pub const DEFAULT_MODEL: &str = "openrouter/moonshotai/kimi-k2.5";

/// File name inside the state directory
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Serialize)]
pub struct BackendSettings {
    pub gateway: GatewaySection,
    pub models: ModelsSection,
}

#[derive(Debug, Serialize)]
pub struct GatewaySection {
    pub mode: &'static str,
    pub auth: AuthSection,
}

#[derive(Debug, Serialize)]
pub struct AuthSection {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsSection {
    pub default: String,
    pub providers: ProvidersSection,
}

#[derive(Debug, Serialize)]
pub struct ProvidersSection {
    pub openrouter: ProviderSection,
}

#[derive(Debug, Serialize)]
pub struct ProviderSection {
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl BackendSettings {
    pub fn new(token: &str, api_key: Option<&str>) -> Self {
        Self {
            gateway: GatewaySection {
                mode: "local",
                auth: AuthSection {
                    token: token.to_string(),
                },
            },
            models: ModelsSection {
                default: DEFAULT_MODEL.to_string(),
                providers: ProvidersSection {
                    openrouter: ProviderSection {
                        api_key: api_key.map(String::from),
                    },
                },
            },
        }
    }
}

/// Create the state directory and write `config.json` into it.
///
/// Returns the path of the written file.
pub fn write_backend_config(
    state_dir: &Path,
    token: &str,
    api_key: Option<&str>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(state_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create state directory '{}': {}",
            state_dir.display(),
            e
        )
    })?;

    let path = state_dir.join(CONFIG_FILE_NAME);
    let settings = BackendSettings::new(token, api_key);
    let json = serde_json::to_string_pretty(&settings)?;

    std::fs::write(&path, json)
        .map_err(|e| anyhow::anyhow!("Failed to write '{}': {}", path.display(), e))?;

    info!(path = %path.display(), "Backend config written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_shape() {
        let settings = BackendSettings::new("tok", Some("sk-or-1"));
        let value = serde_json::to_value(&settings).unwrap();

        assert_eq!(value["gateway"]["mode"], "local");
        assert_eq!(value["gateway"]["auth"]["token"], "tok");
        assert_eq!(value["models"]["default"], DEFAULT_MODEL);
        assert_eq!(value["models"]["providers"]["openrouter"]["apiKey"], "sk-or-1");
    }

    #[test]
    fn test_missing_api_key_is_omitted() {
        let settings = BackendSettings::new("tok", None);
        let value = serde_json::to_value(&settings).unwrap();

        let provider = value["models"]["providers"]["openrouter"].as_object().unwrap();
        assert!(!provider.contains_key("apiKey"));
    }

    #[test]
    fn test_write_creates_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("nested").join(".openclaw");

        let path = write_backend_config(&state_dir, "tok", None).unwrap();
        assert_eq!(path, state_dir.join("config.json"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["gateway"]["auth"]["token"], "tok");
    }

    #[test]
    fn test_write_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();

        write_backend_config(dir.path(), "old", None).unwrap();
        let path = write_backend_config(dir.path(), "new", Some("key")).unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("\"new\""));
        assert!(!written.contains("\"old\""));
    }
}
