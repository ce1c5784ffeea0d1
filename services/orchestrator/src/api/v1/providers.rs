//! Provider registry endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use aviary_provider::ProviderConfig;
use serde::{Deserialize, Serialize};

use super::super::error::ApiError;
use crate::error::OrchestratorError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/providers", post(register_provider))
        .route("/providers", get(list_providers))
        .route("/providers/{name}", delete(remove_provider))
}

#[derive(Debug, Deserialize)]
struct RegisterQuery {
    #[serde(default)]
    replace: bool,
}

async fn register_provider(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
    Json(config): Json<ProviderConfig>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator()
        .providers()
        .register(config, query.replace)
        .await
        .map_err(OrchestratorError::Provider)?;

    Ok(StatusCode::CREATED)
}

#[derive(Debug, Serialize)]
struct ProviderList {
    providers: Vec<String>,
}

async fn list_providers(State(state): State<AppState>) -> Json<ProviderList> {
    Json(ProviderList {
        providers: state.orchestrator().providers().list().await,
    })
}

async fn remove_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator()
        .providers()
        .remove(&name)
        .await
        .map_err(OrchestratorError::Provider)?;

    Ok(StatusCode::NO_CONTENT)
}
