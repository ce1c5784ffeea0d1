//! Orchestrator error taxonomy.
//!
//! Retryability lives with the collaborator errors ([`FetchError`],
//! [`StartError`]); everything that reaches this enum has already exhausted
//! its local retries or was never retryable to begin with.

use std::time::Duration;

use aviary_id::{DeploymentId, WorkerId};
use thiserror::Error;

use crate::collaborators::{BuildError, DispatchError, FetchError, StartError};

/// Errors surfaced by the orchestrator's control operations and pipelines.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The worker descriptor is malformed. Non-retryable.
    #[error("invalid descriptor: {0}")]
    InvalidSpec(String),

    /// Template fetch failed after exhausting retries (or fatally).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Runtime image build failed. Non-retryable: a bad template, not infra.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Instance start failed after exhausting retries.
    #[error(transparent)]
    Start(#[from] StartError),

    /// The instance never passed a readiness probe inside the wait window.
    #[error("instance failed readiness checks within {0:?}")]
    HealthTimeout(Duration),

    /// No healthy endpoint is registered for the worker.
    #[error("no healthy endpoint for worker {0}")]
    NoHealthyEndpoint(WorkerId),

    /// Call dispatch failed (after at most one failover attempt).
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Provider registry or invocation failure.
    #[error(transparent)]
    Provider(#[from] aviary_provider::ProviderError),

    /// No such worker is known to the orchestrator.
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// No such deployment record exists.
    #[error("unknown deployment: {0}")]
    UnknownDeployment(DeploymentId),

    /// The pipeline was cancelled by a teardown request.
    #[error("deployment cancelled")]
    Cancelled,
}
