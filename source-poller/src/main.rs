use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use interfaces::SqliteStore;
use source_poller::api::{self, ApiState};
use source_poller::{AppConfig, Cli, Fetcher, PollerError, PollingPipeline, StatsState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting source poller");

    match dotenvy::from_path(&cli.env_file) {
        Ok(()) => info!("Loaded environment from {}", cli.env_file.display()),
        Err(e) => warn!("Could not load {}: {}, using process environment", cli.env_file.display(), e),
    }

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    info!(
        sources = ?config.sources,
        polling_interval_sec = config.polling_interval.as_secs(),
        server_port = config.server_port,
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database_path.display()))?,
    );

    let fetcher = Arc::new(Fetcher::new(config.client.clone()).context("Failed to build API client")?);
    let stats = Arc::new(StatsState::new());
    let pipeline = Arc::new(PollingPipeline::new(
        fetcher,
        store.clone(),
        stats.clone(),
        config.pipeline_config(),
    ));

    let cancel = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    let api_state = ApiState::new(stats, config.client.max_requests_per_minute);
    tokio::spawn(api_state.clone().sweep_idle_clients(api::CLIENT_EXPIRY, cancel.clone()));
    let app = api::router(api_state).into_make_service_with_connect_info::<SocketAddr>();

    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!("Starting API server on {}", addr);
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("API server failed: {}", e);
            }
            info!("API server stopped");
        })
    };

    let poller = tokio::spawn(pipeline.run(cancel.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received");
    cancel.cancel();

    match poller.await {
        Ok(Err(PollerError::Cancelled)) | Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Polling stopped unexpectedly: {}", e),
        Err(e) => error!("Polling task panicked: {}", e),
    }
    if let Err(e) = server.await {
        error!("API server task panicked: {}", e);
    }

    store.close().await;
    info!("Source poller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
