//! Worker descriptors and derived deployment specs.

use std::collections::BTreeMap;

use aviary_id::WorkerId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OrchestratorError;

/// Runtime isolation class for a worker instance.
///
/// The launcher collaborator interprets this; the orchestrator only carries
/// it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeClass {
    Container,
    Process,
}

/// Immutable description of one worker.
///
/// Identity is `worker_id`; everything else is configuration. Descriptors are
/// never mutated after creation - a changed descriptor means a new deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Stable worker identity.
    pub worker_id: WorkerId,

    /// Human-readable worker name.
    pub name: String,

    /// Where to fetch the deployment template from (http/https).
    pub template_uri: String,

    /// Runtime isolation class.
    pub runtime_class: RuntimeClass,

    /// Environment passed to the launched instance.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Name of the provider this worker invokes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
}

impl WorkerDescriptor {
    /// Structural validation, applied in the pipeline's Resolving stage.
    ///
    /// Failures here are non-retryable: a malformed descriptor stays
    /// malformed.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidSpec(
                "worker name cannot be empty".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.template_uri)
            .map_err(|e| OrchestratorError::InvalidSpec(format!("invalid template_uri: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(OrchestratorError::InvalidSpec(format!(
                "unsupported template_uri scheme: {}",
                url.scheme()
            )));
        }

        if let Some(provider_ref) = &self.provider_ref {
            if provider_ref.is_empty() {
                return Err(OrchestratorError::InvalidSpec(
                    "provider_ref cannot be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Content hash of a descriptor, used for idempotence and change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash the canonical JSON rendering of a descriptor.
    ///
    /// `serde_json` maps are key-sorted, so round-tripping through `Value`
    /// yields a canonical rendering.
    pub fn of(descriptor: &WorkerDescriptor) -> Self {
        let value = serde_json::to_value(descriptor).unwrap_or(serde_json::Value::Null);
        let mut hasher = Sha256::new();
        hasher.update(value.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deployment-time parameters supplied alongside a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployParams {
    /// Image tag for the built runtime artifact.
    #[serde(default)]
    pub image_tag: Option<String>,

    /// Target registry for the built artifact.
    #[serde(default)]
    pub registry: Option<String>,
}

/// Everything one pipeline run needs to know, owned exclusively by that run.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub descriptor: WorkerDescriptor,
    pub image_tag: String,
    pub registry: Option<String>,
    pub spec_hash: SpecHash,
}

impl DeploymentSpec {
    pub fn new(descriptor: WorkerDescriptor, params: DeployParams) -> Self {
        let spec_hash = SpecHash::of(&descriptor);
        let image_tag = params
            .image_tag
            .unwrap_or_else(|| format!("{}:latest", descriptor.name));

        Self {
            descriptor,
            image_tag,
            registry: params.registry,
            spec_hash,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.descriptor.worker_id
    }
}
