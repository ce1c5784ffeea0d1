//! HTTP runtime launcher client.
//!
//! Speaks to a launcher daemon that owns the actual container/process
//! plumbing:
//!
//! - `POST /v1/images?tag=...&runtime_class=...` with the raw template bytes
//!   builds an image and returns `{image_ref, build_log}`.
//! - `POST /v1/instances` with `{image_ref, env}` starts an instance and
//!   returns `{instance_id, url}`.
//! - `DELETE /v1/instances/{instance_id}` stops it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aviary_id::InstanceId;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    BuildError, InstanceAddress, RuntimeImage, RuntimeLauncher, StartError, TemplateArtifact,
};
use crate::descriptor::{DeploymentSpec, RuntimeClass};

/// Default build timeout. Builds are the slowest stage; the bound exists so
/// no pipeline waits forever on a wedged builder.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Default start/stop request timeout.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRuntimeLauncher {
    client: reqwest::Client,
    base_url: String,
    build_timeout: Duration,
    start_timeout: Duration,
}

#[derive(Deserialize)]
struct BuildResponse {
    image_ref: String,
    #[serde(default)]
    build_log: Option<String>,
}

#[derive(Deserialize)]
struct StartResponse {
    instance_id: InstanceId,
    url: String,
}

impl HttpRuntimeLauncher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, build: Duration, start: Duration) -> Self {
        self.build_timeout = build;
        self.start_timeout = start;
        self
    }

    fn runtime_class_str(class: RuntimeClass) -> &'static str {
        match class {
            RuntimeClass::Container => "container",
            RuntimeClass::Process => "process",
        }
    }
}

#[async_trait]
impl RuntimeLauncher for HttpRuntimeLauncher {
    async fn build(
        &self,
        spec: &DeploymentSpec,
        artifact: &TemplateArtifact,
    ) -> Result<RuntimeImage, BuildError> {
        debug!(
            worker_id = %spec.worker_id(),
            image_tag = %spec.image_tag,
            template_bytes = artifact.content.len(),
            "Requesting image build"
        );

        let response = self
            .client
            .post(format!("{}/v1/images", self.base_url))
            .query(&[
                ("tag", spec.image_tag.as_str()),
                (
                    "runtime_class",
                    Self::runtime_class_str(spec.descriptor.runtime_class),
                ),
            ])
            .timeout(self.build_timeout)
            .body(artifact.content.clone())
            .send()
            .await
            .map_err(|e| BuildError {
                reason: format!("build request failed: {e}"),
                log_ref: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BuildError {
                reason: format!("builder returned status {status}: {body}"),
                log_ref: None,
            });
        }

        let parsed: BuildResponse = response.json().await.map_err(|e| BuildError {
            reason: format!("malformed build response: {e}"),
            log_ref: None,
        })?;

        info!(
            worker_id = %spec.worker_id(),
            image_ref = %parsed.image_ref,
            "Image built"
        );

        Ok(RuntimeImage {
            reference: parsed.image_ref,
            build_log: parsed.build_log,
        })
    }

    async fn start(
        &self,
        image: &RuntimeImage,
        env: &BTreeMap<String, String>,
    ) -> Result<InstanceAddress, StartError> {
        let response = self
            .client
            .post(format!("{}/v1/instances", self.base_url))
            .timeout(self.start_timeout)
            .json(&json!({
                "image_ref": image.reference,
                "env": env,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StartError::Timeout
                } else {
                    StartError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StartError::Failed(format!(
                "launcher returned status {status}: {body}"
            )));
        }

        let parsed: StartResponse = response
            .json()
            .await
            .map_err(|e| StartError::Failed(format!("malformed start response: {e}")))?;

        info!(
            instance_id = %parsed.instance_id,
            url = %parsed.url,
            image_ref = %image.reference,
            "Instance started"
        );

        Ok(InstanceAddress {
            instance_id: parsed.instance_id,
            url: parsed.url,
        })
    }

    async fn stop(&self, address: &InstanceAddress) -> Result<(), StartError> {
        let response = self
            .client
            .delete(format!(
                "{}/v1/instances/{}",
                self.base_url, address.instance_id
            ))
            .timeout(self.start_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StartError::Timeout
                } else {
                    StartError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        // 404 means already gone; stop is idempotent.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(StartError::Failed(format!(
                "launcher returned status {status}: {body}"
            )));
        }

        info!(instance_id = %address.instance_id, "Instance stopped");
        Ok(())
    }
}
