use auth_datasource::config::Config;
use auth_datasource::health::HealthStatus;
use auth_datasource::server::StatusServer;
use auth_datasource::supervisor::FailoverSupervisor;
use auth_datasource::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get the log level
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("Failed to load configuration: {}", e.user_message());
            error!("Configuration error details: {}", e.detailed_message());
            return Err(e);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    info!("Starting auth datasource");
    match Config::find_config_file() {
        Some(path) => info!("Configuration loaded from {}", path),
        None => info!("No configuration file found, using environment defaults"),
    }
    info!("Log level set to: {}", config.server.log_level);

    let provider = config.provider();
    let supervisor = Arc::new(FailoverSupervisor::default());
    let pool = supervisor.start(&provider).await;
    info!(
        "Active pool '{}' ({:?}) for {}",
        pool.config().pool_name,
        supervisor.state().await,
        pool.masked_url()
    );
    info!("Pool connections: {} open, {} idle", pool.size(), pool.num_idle());

    let report = supervisor.probe().await;
    match report.status {
        HealthStatus::Up => info!("Database probe: UP"),
        status => warn!("Database probe: {:?} {:?}", status, report.detail_str("error")),
    }

    let server = StatusServer::new(supervisor.clone());
    server.set_component("statusEndpoint", HealthStatus::Up).await;

    let shutdown_signal = setup_shutdown_signal();

    tokio::select! {
        result = server.start(config.server.port) => {
            if let Err(e) = &result {
                error!("Status endpoint failed: {}", e.user_message());
            }
            supervisor.shutdown().await;
            result
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, closing pool");
            if let Err(e) = server.shutdown().await {
                error!("Error during shutdown: {}", e.user_message());
            }
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
