//! External collaborator seams.
//!
//! The orchestrator drives four collaborators it does not implement: the
//! template source, the runtime launcher, the per-instance readiness probe,
//! and the per-instance call endpoint. Each is a trait so tests substitute
//! in-memory doubles; the shipped implementations speak HTTP via `reqwest`.

mod dispatch;
mod launcher;
mod probe;
mod template;

pub use dispatch::HttpCallDispatcher;
pub use launcher::HttpRuntimeLauncher;
pub use probe::HttpReadinessProbe;
pub use template::HttpTemplateSource;

use std::collections::BTreeMap;

use async_trait::async_trait;
use aviary_id::InstanceId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::DeploymentSpec;

// =============================================================================
// Shared types
// =============================================================================

/// Raw template content fetched from a template source.
#[derive(Debug, Clone)]
pub struct TemplateArtifact {
    /// The URI the artifact was fetched from.
    pub uri: String,

    /// Template bytes, opaque to the orchestrator.
    pub content: Bytes,
}

/// A built runtime artifact, ready to launch.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    /// Launcher-resolvable image reference.
    pub reference: String,

    /// Reference to the captured build log, if the launcher kept one.
    pub build_log: Option<String>,
}

/// Address of one live runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub instance_id: InstanceId,

    /// Base URL of the instance's HTTP surface (`/health`, `/call`).
    pub url: String,
}

/// Result of one readiness/liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Template fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The template does not exist. Fatal.
    #[error("template not found: {0}")]
    NotFound(String),

    /// The source rejected the request (4xx). Fatal: retrying the same
    /// request cannot help.
    #[error("template fetch rejected with status {status}")]
    Rejected { status: u16 },

    /// The source failed (5xx). Transient.
    #[error("template source error, status {status}")]
    ServerError { status: u16 },

    /// The fetch timed out. Transient.
    #[error("template fetch timed out")]
    Timeout,

    /// Transport-level failure (connect refused, DNS, ...). Transient.
    #[error("template source unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    /// Whether the pipeline may retry the fetch with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError { .. } | Self::Timeout | Self::Unreachable(_)
        )
    }
}

/// Runtime build failures. Always fatal: they indicate a bad template.
#[derive(Debug, Error)]
#[error("build failed: {reason}")]
pub struct BuildError {
    pub reason: String,

    /// Reference to the captured build log, retained in the record error.
    pub log_ref: Option<String>,
}

/// Instance start/stop failures. Transient by contract: the pipeline retries
/// a bounded number of times.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("instance failed to start: {0}")]
    Failed(String),

    #[error("launcher request timed out")]
    Timeout,

    #[error("launcher unreachable: {0}")]
    Unreachable(String),
}

/// Call dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Could not reach the instance. Marks the endpoint failed and permits
    /// one failover.
    #[error("call to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    /// The call exceeded the per-call timeout. Same handling as connection
    /// failures.
    #[error("call to {address} timed out")]
    Timeout { address: String },

    /// The worker answered with a non-success status. The endpoint is
    /// reachable; no failover.
    #[error("worker returned status {status}")]
    Status { status: u16 },

    /// The worker answered with a body the router could not parse.
    #[error("malformed worker response: {0}")]
    Malformed(String),
}

impl DispatchError {
    /// Whether the router should mark the endpoint failed and try another.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Fetches deployment templates.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<TemplateArtifact, FetchError>;
}

/// Builds runtime images and manages instance processes.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    /// Construct a runtime image from a fetched template.
    async fn build(
        &self,
        spec: &DeploymentSpec,
        artifact: &TemplateArtifact,
    ) -> Result<RuntimeImage, BuildError>;

    /// Launch an instance of a built image with the given environment.
    async fn start(
        &self,
        image: &RuntimeImage,
        env: &BTreeMap<String, String>,
    ) -> Result<InstanceAddress, StartError>;

    /// Terminate an instance. Idempotent: stopping an unknown instance is
    /// not an error.
    async fn stop(&self, address: &InstanceAddress) -> Result<(), StartError>;
}

/// Probes one instance's readiness surface.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, address: &InstanceAddress) -> ProbeOutcome;
}

/// Dispatches one call to one instance.
#[async_trait]
pub trait CallDispatcher: Send + Sync {
    async fn dispatch(&self, address: &InstanceAddress, message: &str)
        -> Result<String, DispatchError>;
}
