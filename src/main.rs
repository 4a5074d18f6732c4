use gatewrap::config::Config;
use gatewrap::gate::ReadinessGate;
use gatewrap::pool::PoolConfig;
use gatewrap::process::ProcessSupervisor;
use gatewrap::router::ProxyRouter;
use gatewrap::server::FrontendServer;
use gatewrap::state::write_backend_config;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Version information for the wrapper
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatewrap=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional TOML file; environment variables always win
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let loaded = match &config_path {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = loaded.map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    let token = config.backend.resolve_token().to_string();
    print_startup_banner(&config);

    let bind_ip: IpAddr = config.server.bind.parse().map_err(|e| {
        error!(bind = %config.server.bind, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e)
    })?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = ProcessSupervisor::new(config.backend.clone(), token.clone());
    let gate = ReadinessGate::new(supervisor);

    let pool_config = PoolConfig {
        max_idle: config.server.pool_max_idle,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let router = Arc::new(ProxyRouter::new(
        config.backend.target_addr(),
        config.server.request_timeout(),
        pool_config,
    ));

    let server = FrontendServer::bind(bind_addr, Arc::clone(&gate), Arc::clone(&router), shutdown_rx).await?;

    info!(addr = %bind_addr, "Wrapper server bound");
    info!(backend = %router.target(), "Proxying to gateway");
    info!(token = %token, "Gateway token");

    write_backend_config(
        &config.backend.state_dir,
        &token,
        config.backend.api_key.as_deref(),
    )?;

    // Start the backend right away instead of waiting for the first request
    let eager_gate = Arc::clone(&gate);
    tokio::spawn(async move {
        let state = eager_gate.ensure_started().await;
        info!(state = state.as_str(), "Initial backend start finished");
    });

    server.run_until(shutdown_tx, wait_for_shutdown_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting wrapper");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        port = config.backend.port,
        state_dir = %config.backend.state_dir.display(),
        "Backend configuration"
    );
    info!(
        ready_marker = %config.backend.ready_marker,
        startup_timeout_ms = config.backend.startup_timeout_ms,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        api_key_set = config.backend.api_key.is_some(),
        "Readiness settings"
    );
}
