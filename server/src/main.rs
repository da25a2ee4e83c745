//! `VoiceChat` SFU - Main Entry Point

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{error, info};

use vc_sfu::{api, config, engine::WorkerPool};

fn init_tracing(format: config::LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vc_sfu=debug,tower_http=debug".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        config::LogFormat::Json => builder.json().init(),
        config::LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    // Initialize tracing
    init_tracing(config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting VoiceChat SFU"
    );

    // Start media workers
    let pool = WorkerPool::new(config.media_workers, config.worker_settings())
        .context("Failed to start media workers")?;
    info!(
        workers = config.media_workers,
        min_port = config.rtc_min_port,
        max_port = config.rtc_max_port,
        "Media workers started"
    );

    // Build application state
    let state = api::AppState::new(config.clone(), pool);
    let maintenance = state.signaling.start_maintenance();
    let pool = state.pool.clone();

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "Server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let result = tokio::select! {
        result = server => result.context("Server error"),
        worker_id = pool.wait_for_worker_death() => {
            error!(worker_id, "Media worker died, shutting down");
            Err(anyhow::anyhow!("media worker {worker_id} died"))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to install CTRL+C signal handler")?;
            info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    maintenance.abort();
    pool.close();
    info!("Server shutdown complete");

    result
}
