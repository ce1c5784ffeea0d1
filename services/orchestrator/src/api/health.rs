//! Service health endpoints for load balancers and process supervisors.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,

    /// Live worker instances currently tracked.
    pub instances: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "aviary-orchestrator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        instances: state.orchestrator().instance_count().await,
    })
}

async fn readyz(State(state): State<AppState>) -> Json<HealthResponse> {
    // No external dependency gates readiness; serving traffic is being ready.
    healthz(State(state)).await
}
