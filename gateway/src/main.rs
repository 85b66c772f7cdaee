//! netdiag gateway: streams ping, dig and traceroute output over WebSocket

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netdiag_gateway::config::{self, ConfigSource, LogFormat, LoggingConfig};
use netdiag_gateway::rate_limit::RateLimiter;
use netdiag_gateway::{server, AppState, Metrics, SessionConfig, SessionManager};
use netdiag_tools::{Executor, ToolTable, Validator};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = config::load_config()?;
    init_logging(&config.logging);

    info!("netdiag gateway starting...");
    match &source {
        ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
        ConfigSource::Defaults(path) => {
            warn!("Config file not found at {}, using defaults", path.display())
        }
    }

    let table = config.tools.apply(ToolTable::for_host());
    for tool in netdiag_tools::Tool::ALL {
        if let Some(spec) = table.spec(tool) {
            info!("{tool}: {}", spec.executable.display());
        }
    }
    let executor = Executor::new(table).with_timeout(config.executor.timeout());

    let metrics = Arc::new(Metrics::new());
    let manager = Arc::new(SessionManager::new(
        executor,
        Validator::new(),
        SessionConfig::from(&config.session),
        metrics,
    ));

    let limiter = config
        .rate_limit
        .enabled
        .then(|| RateLimiter::per_minute(config.rate_limit.requests_per_minute));
    let state = AppState::new(
        manager.clone(),
        limiter,
        config.server.allowed_origins.clone(),
    );
    let app = server::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr} (WebSocket at /ws)");

    server::serve(listener, app, shutdown_signal(manager.clone())).await?;

    let timeout = config.server.shutdown_timeout();
    if !manager.wait_drained(timeout).await {
        warn!(
            "{} session(s) still open after {timeout:?}, exiting anyway",
            manager.active_sessions()
        );
    }

    info!("netdiag gateway stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    match config.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolves on SIGINT or SIGTERM, after telling every session to close.
async fn shutdown_signal(manager: Arc<SessionManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }

    manager.shutdown();
}
