use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod images;
pub mod metrics;

/// Request body cap: the 1 MB image limit plus multipart overhead.
pub const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// The public HTTP surface.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/upload", post(images::upload_image))
        .route("/images/random", get(images::random_images))
        .route("/images/{id}", get(images::get_image))
        .route("/images/{id}/status", get(images::get_image_status))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
