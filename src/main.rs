use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use image_pipeline::{app_state::AppState, config::AppConfig, db, routes};

fn describe_metrics() {
    metrics::describe_counter!(
        "image_jobs_submitted_total",
        "Uploads admitted and queued for processing"
    );
    metrics::describe_counter!(
        "image_uploads_rejected_total",
        "Uploads rejected by validation, by reason"
    );
    metrics::describe_counter!(
        "image_jobs_completed_total",
        "Image jobs that reached COMPLETED"
    );
    metrics::describe_counter!("image_jobs_failed_total", "Image jobs that reached FAILED");
    metrics::describe_counter!(
        "image_records_expired_total",
        "Image records removed by the expiry sweep"
    );
    metrics::describe_counter!(
        "registrations_expired_total",
        "Lapsed registrations removed by the expiry sweep"
    );
    metrics::describe_histogram!(
        "image_transform_seconds",
        "Time to decode, transform and encode one image"
    );
    metrics::describe_gauge!(
        "image_queue_depth",
        "Tasks waiting for delivery, delayed or ready"
    );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    tracing::info!(bind_addr = %config.bind_addr, storage = ?config.storage_backend, "Starting image-pipeline server");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Running database migrations");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    let state = AppState::from_pool(&config, pool).expect("Failed to initialize services");
    let app = routes::router(state, Arc::new(prometheus));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!(bind_addr = %config.bind_addr, "Server listening");

    axum::serve(listener, app).await.expect("Server error");
}
