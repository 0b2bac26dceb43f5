use image_pipeline::{app_state::AppState, config::AppConfig, services::worker::WorkerPool};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image transform worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let state = AppState::connect(&config)
        .await
        .expect("Failed to initialize services");

    // Tasks left in flight by a crashed worker become deliverable again.
    match state.queue.requeue_in_flight().await {
        Ok(0) => {}
        Ok(moved) => tracing::warn!(moved, "Requeued tasks left in flight"),
        Err(e) => tracing::error!(error = %e, "Failed to requeue in-flight tasks"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested, finishing in-flight tasks");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Worker ready, starting task processing loops");
    WorkerPool::new(state).run(shutdown_rx).await;
}
