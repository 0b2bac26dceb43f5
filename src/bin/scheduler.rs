use image_pipeline::{app_state::AppState, config::AppConfig, services::expiry::ExpiryScheduler};
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

    tracing::info!("Starting expiry scheduler");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let state = AppState::connect(&config)
        .await
        .expect("Failed to initialize services");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    ExpiryScheduler::new(state).run(shutdown_rx).await;
}
