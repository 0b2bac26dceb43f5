use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: ComponentHealth,
    pub queue_depth: Option<u64>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_check<E: std::fmt::Display>(component: &str, started: Instant, check: Result<(), E>) -> Self {
        match check {
            Ok(()) => Self {
                status: "ok",
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(component, error = %e, "Health check failed");
                Self {
                    status: "error",
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: database and queue reachability, plus the queue backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = ComponentHealth::from_check("database", started, state.images.ping().await);

    let started = Instant::now();
    let queue = ComponentHealth::from_check("queue", started, state.queue.health_check().await);

    let queue_depth = state.queue.queue_depth().await.ok();
    if let Some(depth) = queue_depth {
        metrics::gauge!("image_queue_depth").set(depth as f64);
    }

    let healthy = database.is_ok() && queue.is_ok();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            database,
            queue,
            queue_depth,
        },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
