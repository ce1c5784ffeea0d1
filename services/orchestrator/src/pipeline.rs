//! Deployment pipeline: drives one worker deployment through the state
//! machine in `record.rs`.
//!
//! Each pipeline run owns its `DeploymentSpec` and is the only writer of its
//! `DeploymentRecord`. Transient stage failures (fetch, start) retry locally
//! with bounded backoff; structural failures (bad descriptor, bad template)
//! fail the record immediately. Cancellation is cooperative and only
//! observed between stages, so a stage is never interrupted while it may be
//! mutating external state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aviary_id::WorkerId;
use aviary_retry::BackoffPolicy;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::collaborators::{
    BuildError, InstanceAddress, ProbeOutcome, RuntimeImage, TemplateArtifact,
};
use crate::descriptor::DeploymentSpec;
use crate::error::OrchestratorError;
use crate::record::{DeploymentRecord, DeploymentState};
use crate::router::Endpoint;

/// Pipeline stage tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Backoff for transient template fetch failures.
    pub fetch_backoff: BackoffPolicy,

    /// Maximum template fetch attempts.
    pub fetch_attempts: u32,

    /// Backoff for instance start failures.
    pub start_backoff: BackoffPolicy,

    /// Maximum instance start attempts.
    pub start_attempts: u32,

    /// Bound on one build call.
    pub build_timeout: Duration,

    /// Interval between readiness polls while waiting for the first
    /// successful probe.
    pub readiness_interval: Duration,

    /// Maximum wait for the first successful readiness probe.
    pub readiness_window: Duration,

    /// Bound on one readiness probe call.
    pub probe_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
            fetch_attempts: 5,
            start_backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(10),
                jitter: 0.25,
            },
            start_attempts: 3,
            build_timeout: Duration::from_secs(300),
            readiness_interval: Duration::from_secs(1),
            readiness_window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Live instances by worker, used for orphan teardown on redeploy and for
/// instance cleanup on teardown.
///
/// Per the idempotence contract, a worker has at most one live instance; the
/// pipeline replaces the entry only after tearing the old instance down.
pub struct InstanceTable {
    inner: RwLock<HashMap<WorkerId, InstanceAddress>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, worker_id: WorkerId, address: InstanceAddress) {
        self.inner.write().await.insert(worker_id, address);
    }

    pub async fn get(&self, worker_id: WorkerId) -> Option<InstanceAddress> {
        self.inner.read().await.get(&worker_id).cloned()
    }

    pub async fn remove(&self, worker_id: WorkerId) -> Option<InstanceAddress> {
        self.inner.write().await.remove(&worker_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for InstanceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collaborators and state handed to every pipeline run.
#[derive(Clone)]
pub struct PipelineDeps {
    pub templates: Arc<dyn crate::collaborators::TemplateSource>,
    pub launcher: Arc<dyn crate::collaborators::RuntimeLauncher>,
    pub probe: Arc<dyn crate::collaborators::ReadinessProbe>,
    pub router: Arc<crate::router::WorkerRouter>,
    pub monitor: Arc<crate::health::HealthMonitor>,
    pub instances: Arc<InstanceTable>,
    pub providers: Arc<aviary_provider::ProviderRegistry>,
}

/// One deployment attempt for one worker.
pub struct DeploymentPipeline {
    spec: DeploymentSpec,
    record: Arc<RwLock<DeploymentRecord>>,
    deps: PipelineDeps,
    config: PipelineConfig,
    cancel: watch::Receiver<bool>,
}

impl DeploymentPipeline {
    pub fn new(
        spec: DeploymentSpec,
        record: Arc<RwLock<DeploymentRecord>>,
        deps: PipelineDeps,
        config: PipelineConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            record,
            deps,
            config,
            cancel,
        }
    }

    /// Run the pipeline to a terminal state.
    ///
    /// On success the worker's endpoint is registered and health-watched; on
    /// failure the record is `failed` with the triggering error retained.
    pub async fn run(mut self) -> Result<Endpoint, OrchestratorError> {
        let worker_id = self.spec.worker_id();

        match self.execute().await {
            Ok(endpoint) => {
                info!(
                    worker_id = %worker_id,
                    endpoint_id = %endpoint.endpoint_id,
                    "Deployment running"
                );
                Ok(endpoint)
            }
            Err(err) => {
                warn!(worker_id = %worker_id, error = %err, "Deployment failed");
                let mut record = self.record.write().await;
                record.fail(&err);
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> Result<Endpoint, OrchestratorError> {
        let worker_id = self.spec.worker_id();

        self.advance(DeploymentState::Resolving).await?;
        self.spec.descriptor.validate()?;
        if let Some(provider_ref) = &self.spec.descriptor.provider_ref {
            if !self.deps.providers.contains(provider_ref).await {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "unknown provider_ref: {provider_ref}"
                )));
            }
        }

        self.advance(DeploymentState::Fetching).await?;
        let artifact = self.fetch_with_retry().await?;

        self.advance(DeploymentState::Building).await?;
        let image = self.build(&artifact).await?;

        // Idempotent redeploy: tear down any live instance left by a previous
        // attempt before starting a new one, routing first.
        if let Some(orphan) = self.deps.instances.remove(worker_id).await {
            warn!(
                worker_id = %worker_id,
                instance_id = %orphan.instance_id,
                "Tearing down orphaned instance from prior deployment"
            );
            for endpoint in self.deps.router.remove_worker(worker_id).await {
                self.deps.monitor.unwatch(endpoint.endpoint_id).await;
            }
            if let Err(e) = self.deps.launcher.stop(&orphan).await {
                warn!(worker_id = %worker_id, error = %e, "Orphan teardown failed");
            }
        }

        self.advance(DeploymentState::Starting).await?;
        let address = self.start_with_retry(&image).await?;
        self.deps.instances.insert(worker_id, address.clone()).await;

        self.advance(DeploymentState::HealthChecking).await?;
        if let Err(err) = self.await_readiness(&address).await {
            // Never leak a half-started runtime.
            self.deps.instances.remove(worker_id).await;
            if let Err(e) = self.deps.launcher.stop(&address).await {
                warn!(worker_id = %worker_id, error = %e, "Teardown after failed readiness");
            }
            return Err(err);
        }

        // Record goes Running before the endpoint becomes routable, so the
        // routable set never holds an endpoint whose record is earlier than
        // Running.
        self.advance(DeploymentState::Running).await?;

        let endpoint = Endpoint::new(worker_id, address);
        self.deps.router.register(endpoint.clone()).await;
        self.deps.monitor.watch(endpoint.clone()).await;

        Ok(endpoint)
    }

    /// Move the record into the next stage, checking for cancellation first.
    async fn advance(&self, next: DeploymentState) -> Result<(), OrchestratorError> {
        self.checkpoint()?;

        let mut record = self.record.write().await;
        record.transition(next);
        debug!(
            deployment_id = %record.deployment_id,
            worker_id = %record.worker_id,
            state = %next,
            "Deployment stage"
        );
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), OrchestratorError> {
        if *self.cancel.borrow() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn fetch_with_retry(&self) -> Result<TemplateArtifact, OrchestratorError> {
        let uri = &self.spec.descriptor.template_uri;
        let mut attempt = 0u32;

        loop {
            match self.deps.templates.fetch(uri).await {
                Ok(artifact) => return Ok(artifact),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.fetch_attempts => {
                    let delay = self.config.fetch_backoff.delay(attempt);
                    warn!(
                        worker_id = %self.spec.worker_id(),
                        uri = %uri,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Template fetch failed, retrying"
                    );
                    attempt += 1;
                    self.sleep_or_cancel(delay).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn build(&self, artifact: &TemplateArtifact) -> Result<RuntimeImage, OrchestratorError> {
        match timeout(
            self.config.build_timeout,
            self.deps.launcher.build(&self.spec, artifact),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(BuildError {
                reason: format!("build timed out after {:?}", self.config.build_timeout),
                log_ref: None,
            }
            .into()),
        }
    }

    async fn start_with_retry(&self, image: &RuntimeImage) -> Result<InstanceAddress, OrchestratorError> {
        let env = &self.spec.descriptor.env;
        let mut attempt = 0u32;

        loop {
            match self.deps.launcher.start(image, env).await {
                Ok(address) => return Ok(address),
                Err(err) if attempt + 1 < self.config.start_attempts => {
                    let delay = self.config.start_backoff.delay(attempt);
                    warn!(
                        worker_id = %self.spec.worker_id(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Instance start failed, retrying"
                    );
                    attempt += 1;
                    self.sleep_or_cancel(delay).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Poll readiness until the first success or the window closes.
    ///
    /// On timeout the caller tears the instance down; this function only
    /// reports.
    async fn await_readiness(&self, address: &InstanceAddress) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + self.config.readiness_window;

        loop {
            self.checkpoint()?;

            match timeout(self.config.probe_timeout, self.deps.probe.probe(address)).await {
                Ok(ProbeOutcome::Healthy) => return Ok(()),
                Ok(ProbeOutcome::Unhealthy(reason)) => {
                    debug!(
                        worker_id = %self.spec.worker_id(),
                        instance_id = %address.instance_id,
                        reason = %reason,
                        "Instance not ready yet"
                    );
                }
                Err(_) => {
                    debug!(
                        worker_id = %self.spec.worker_id(),
                        instance_id = %address.instance_id,
                        "Readiness probe timed out"
                    );
                }
            }

            if Instant::now() + self.config.readiness_interval > deadline {
                return Err(OrchestratorError::HealthTimeout(self.config.readiness_window));
            }
            self.sleep_or_cancel(self.config.readiness_interval).await?;
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> Result<(), OrchestratorError> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.changed() => self.checkpoint(),
        }
    }
}
