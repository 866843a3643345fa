//! Health check HTTP route handlers
//!
//! - `GET /health` - simple liveness check (returns 200 OK)
//! - `GET /health/live` - liveness probe, never touches dependencies
//! - `GET /health/ready` - readiness check against storage and model backends

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;

use crate::services::HealthService;

#[derive(Clone)]
pub struct HealthState {
    pub health_service: Arc<HealthService>,
}

impl HealthState {
    pub fn new(health_service: HealthService) -> Self {
        Self {
            health_service: Arc::new(health_service),
        }
    }
}

/// Create health check router
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(simple_health))
        .route("/live", get(liveness_probe))
        .route("/ready", get(readiness_probe))
        .with_state(state)
}

async fn simple_health() -> &'static str {
    "OK"
}

async fn liveness_probe() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 200 if every checked dependency is healthy, 503 otherwise
async fn readiness_probe(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.health_service.check_all().await;

    let status_code = if response.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health() {
        let response = simple_health().await;
        assert_eq!(response, "OK");
    }

    #[tokio::test]
    async fn test_readiness_without_dependencies() {
        let state = HealthState::new(HealthService::new(None));
        let response = readiness_probe(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
