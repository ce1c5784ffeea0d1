//! Worker deployment, status, teardown, and call endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use aviary_id::{DeploymentId, WorkerId};
use serde::{Deserialize, Serialize};

use super::super::error::ApiError;
use crate::descriptor::{DeployParams, WorkerDescriptor};
use crate::record::DeploymentRecord;
use crate::router::EndpointInfo;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workers", post(deploy_worker))
        .route("/workers/{worker_id}", delete(teardown_worker))
        .route("/workers/{worker_id}/deployment", get(worker_deployment))
        .route("/workers/{worker_id}/endpoints", get(worker_endpoints))
        .route("/workers/{worker_id}/call", post(call_worker))
        .route("/deployments/{deployment_id}", get(deployment_status))
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    descriptor: WorkerDescriptor,
    #[serde(default)]
    params: DeployParams,
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    deployment_id: DeploymentId,
}

/// Accept a deployment and return its tracking id.
///
/// Always 202: deployment is asynchronous, and failures (including
/// validation) are observed through the deployment record.
async fn deploy_worker(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> (StatusCode, Json<DeployResponse>) {
    let deployment_id = state
        .orchestrator()
        .deploy(request.descriptor, request.params)
        .await;

    (StatusCode::ACCEPTED, Json(DeployResponse { deployment_id }))
}

async fn deployment_status(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    let deployment_id = DeploymentId::parse(&deployment_id)
        .map_err(|e| ApiError::bad_request("invalid_deployment_id", e.to_string()))?;

    let record = state.orchestrator().status(deployment_id).await?;
    Ok(Json(record))
}

async fn worker_deployment(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    let record = state.orchestrator().worker_status(worker_id).await?;
    Ok(Json(record))
}

async fn worker_endpoints(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<Vec<EndpointInfo>>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    Ok(Json(state.orchestrator().endpoints(worker_id).await))
}

async fn teardown_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    state.orchestrator().teardown(worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CallRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct CallResponse {
    response: String,
}

async fn call_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(request): Json<CallRequest>,
) -> Result<Json<CallResponse>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    let response = state
        .orchestrator()
        .call(worker_id, &request.message)
        .await?;
    Ok(Json(CallResponse { response }))
}

fn parse_worker_id(raw: &str) -> Result<WorkerId, ApiError> {
    WorkerId::parse(raw).map_err(|e| ApiError::bad_request("invalid_worker_id", e.to_string()))
}
