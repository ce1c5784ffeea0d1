//! The orchestrator: accepts deploy/teardown/call requests, runs deployment
//! pipelines concurrently, and reacts to eviction notices from the health
//! monitor.
//!
//! Explicitly constructed and passed by reference (`Clone` is cheap, the
//! state is shared behind one `Arc`); created at startup, shut down with the
//! process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aviary_id::{DeploymentId, WorkerId};
use aviary_provider::ProviderRegistry;
use aviary_retry::{RetryBudget, DEFAULT_REDEPLOY_BUDGET, DEFAULT_REDEPLOY_WINDOW};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::collaborators::{CallDispatcher, ReadinessProbe, RuntimeLauncher, TemplateSource};
use crate::descriptor::{DeployParams, DeploymentSpec, WorkerDescriptor};
use crate::error::OrchestratorError;
use crate::health::{EvictionNotice, HealthConfig, HealthMonitor};
use crate::pipeline::{DeploymentPipeline, InstanceTable, PipelineConfig, PipelineDeps};
use crate::record::{DeploymentRecord, DeploymentState, DeploymentTable};
use crate::router::{EndpointInfo, RouterConfig, WorkerRouter};

/// Bound on waiting for an in-flight pipeline to settle during teardown.
const TEARDOWN_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pipeline: PipelineConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,

    /// Automatic redeploys allowed per worker inside the window.
    pub redeploy_budget: u32,

    /// Sliding window for the redeploy budget.
    pub redeploy_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
            router: RouterConfig::default(),
            redeploy_budget: DEFAULT_REDEPLOY_BUDGET,
            redeploy_window: DEFAULT_REDEPLOY_WINDOW,
        }
    }
}

/// Book-keeping for one known worker.
struct WorkerEntry {
    descriptor: WorkerDescriptor,
    params: DeployParams,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    attempt: u32,
}

struct Inner {
    providers: Arc<ProviderRegistry>,
    router: Arc<WorkerRouter>,
    monitor: Arc<HealthMonitor>,
    launcher: Arc<dyn RuntimeLauncher>,
    deps: PipelineDeps,
    records: DeploymentTable,
    instances: Arc<InstanceTable>,
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    redeploy_budget: Mutex<RetryBudget>,
    config: OrchestratorConfig,
}

/// Worker fleet orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire up the orchestrator and return it together with the eviction
    /// stream; the caller spawns [`Orchestrator::run_eviction_loop`] on it.
    pub fn new(
        providers: Arc<ProviderRegistry>,
        templates: Arc<dyn TemplateSource>,
        launcher: Arc<dyn RuntimeLauncher>,
        probe: Arc<dyn ReadinessProbe>,
        dispatcher: Arc<dyn CallDispatcher>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::Receiver<EvictionNotice>) {
        let router = Arc::new(WorkerRouter::new(dispatcher, config.router.clone()));
        let (monitor, evictions) =
            HealthMonitor::new(Arc::clone(&router), Arc::clone(&probe), config.health.clone());
        let monitor = Arc::new(monitor);
        let instances = Arc::new(InstanceTable::new());

        let deps = PipelineDeps {
            templates,
            launcher: Arc::clone(&launcher),
            probe,
            router: Arc::clone(&router),
            monitor: Arc::clone(&monitor),
            instances: Arc::clone(&instances),
            providers: Arc::clone(&providers),
        };

        let redeploy_budget = RetryBudget::new(config.redeploy_budget, config.redeploy_window);

        let orchestrator = Self {
            inner: Arc::new(Inner {
                providers,
                router,
                monitor,
                launcher,
                deps,
                records: DeploymentTable::new(),
                instances,
                workers: Mutex::new(HashMap::new()),
                redeploy_budget: Mutex::new(redeploy_budget),
                config,
            }),
        };

        (orchestrator, evictions)
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    /// Start a deployment and return its tracking id immediately.
    ///
    /// Pipeline failures are never thrown from here; they land in the record
    /// and are observed via [`Orchestrator::status`]. Re-deploying a known
    /// worker cancels its in-flight pipeline first, so one worker never has
    /// two live pipelines.
    pub async fn deploy(
        &self,
        descriptor: WorkerDescriptor,
        params: DeployParams,
    ) -> DeploymentId {
        let worker_id = descriptor.worker_id;
        let attempt = {
            let workers = self.inner.workers.lock().await;
            workers.get(&worker_id).map(|e| e.attempt + 1).unwrap_or(1)
        };
        self.start_pipeline(descriptor, params, attempt).await
    }

    /// Snapshot of one deployment record.
    pub async fn status(
        &self,
        deployment_id: DeploymentId,
    ) -> Result<DeploymentRecord, OrchestratorError> {
        self.inner
            .records
            .snapshot(deployment_id)
            .await
            .ok_or(OrchestratorError::UnknownDeployment(deployment_id))
    }

    /// Latest deployment record for a worker.
    pub async fn worker_status(
        &self,
        worker_id: WorkerId,
    ) -> Result<DeploymentRecord, OrchestratorError> {
        self.inner
            .records
            .latest_for_worker(worker_id)
            .await
            .ok_or(OrchestratorError::UnknownWorker(worker_id))
    }

    /// Tear a worker down: cancel its pipeline, deregister its endpoints
    /// before its instance is terminated, and mark the record stopped.
    pub async fn teardown(&self, worker_id: WorkerId) -> Result<(), OrchestratorError> {
        let entry = {
            let mut workers = self.inner.workers.lock().await;
            workers
                .remove(&worker_id)
                .ok_or(OrchestratorError::UnknownWorker(worker_id))?
        };

        info!(worker_id = %worker_id, "Teardown requested");

        // Cooperative cancel; the pipeline notices at its next stage boundary.
        let _ = entry.cancel.send(true);

        // Stop routing new calls right away.
        for endpoint in self.inner.router.remove_worker(worker_id).await {
            self.inner.monitor.unwatch(endpoint.endpoint_id).await;
        }

        // Wait for the pipeline to settle, then sweep again: a pipeline that
        // was already past its cancellation check may have published in the
        // meantime.
        if timeout(TEARDOWN_SETTLE_TIMEOUT, entry.task).await.is_err() {
            warn!(worker_id = %worker_id, "Pipeline did not settle within teardown timeout");
        }
        for endpoint in self.inner.router.remove_worker(worker_id).await {
            self.inner.monitor.unwatch(endpoint.endpoint_id).await;
        }

        // Deregistration above happens-before instance termination here.
        if let Some(address) = self.inner.instances.remove(worker_id).await {
            if let Err(e) = self.inner.launcher.stop(&address).await {
                warn!(worker_id = %worker_id, error = %e, "Instance stop failed during teardown");
            }
        }

        if let Some(record) = self.inner.records.latest_entry_for_worker(worker_id).await {
            let mut record = record.write().await;
            record.transition(DeploymentState::Stopped);
        }

        info!(worker_id = %worker_id, "Teardown complete");
        Ok(())
    }

    /// Route one call to the worker.
    pub async fn call(
        &self,
        worker_id: WorkerId,
        message: &str,
    ) -> Result<String, OrchestratorError> {
        self.inner.router.route(worker_id, message).await
    }

    /// Drop superseded terminal records. Returns how many were collected.
    pub async fn gc_records(&self) -> usize {
        self.inner.records.gc().await
    }

    /// The provider registry this orchestrator configures workers from.
    pub fn providers(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.inner.providers)
    }

    /// Endpoint views for a worker.
    pub async fn endpoints(&self, worker_id: WorkerId) -> Vec<EndpointInfo> {
        self.inner.router.endpoints(worker_id).await
    }

    /// Live instance count across the fleet.
    pub async fn instance_count(&self) -> usize {
        self.inner.instances.len().await
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// Consume eviction notices until shutdown.
    ///
    /// Each notice stops the dead instance, fails the record for audit, and
    /// schedules a fresh pipeline run if the worker's redeploy budget allows.
    pub async fn run_eviction_loop(
        self,
        mut evictions: mpsc::Receiver<EvictionNotice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                notice = evictions.recv() => {
                    match notice {
                        Some(notice) => self.handle_eviction(notice).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Eviction loop shutting down");
    }

    async fn handle_eviction(&self, notice: EvictionNotice) {
        let worker_id = notice.endpoint.worker_id;

        warn!(
            worker_id = %worker_id,
            endpoint_id = %notice.endpoint.endpoint_id,
            "Handling eviction"
        );

        // The record that was Running is now failed; the error is retained.
        if let Some(record) = self.inner.records.latest_entry_for_worker(worker_id).await {
            let mut record = record.write().await;
            if record.state == DeploymentState::Running {
                record.fail("evicted after repeated health probe failures");
            }
        }

        if let Some(address) = self.inner.instances.remove(worker_id).await {
            if let Err(e) = self.inner.launcher.stop(&address).await {
                warn!(worker_id = %worker_id, error = %e, "Evicted instance stop failed");
            }
        }

        self.schedule_redeploy(worker_id).await;
    }

    /// Re-run the pipeline for a worker if its redeploy budget allows.
    ///
    /// Shared by eviction handling and health-timeout retries; the budget is
    /// one windowed counter per worker, so the orchestrator never retries
    /// indefinitely.
    fn schedule_redeploy(&self, worker_id: WorkerId) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let exhausted = {
                let mut budget = self.inner.redeploy_budget.lock().await;
                budget.record_failure(&worker_id.to_string())
            };
            if exhausted {
                error!(
                    worker_id = %worker_id,
                    "Redeploy budget exhausted, abandoning worker"
                );
                return;
            }

            let Some((descriptor, params, attempt)) = ({
                let workers = self.inner.workers.lock().await;
                workers
                    .get(&worker_id)
                    .map(|e| (e.descriptor.clone(), e.params.clone(), e.attempt + 1))
            }) else {
                // Torn down in the meantime.
                return;
            };

            info!(worker_id = %worker_id, attempt, "Scheduling redeploy");
            self.start_pipeline(descriptor, params, attempt).await;
        })
    }

    /// Cancel all pipelines and probe loops (process shutdown). Instances
    /// are left running; they belong to the launcher's lifecycle, not ours.
    pub async fn shutdown(&self) {
        let mut workers = self.inner.workers.lock().await;
        for (_, entry) in workers.drain() {
            let _ = entry.cancel.send(true);
        }
        self.inner.monitor.unwatch_all().await;
        info!("Orchestrator shut down");
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    async fn start_pipeline(
        &self,
        descriptor: WorkerDescriptor,
        params: DeployParams,
        attempt: u32,
    ) -> DeploymentId {
        let worker_id = descriptor.worker_id;

        let deployment_id = DeploymentId::new();
        let record = self
            .inner
            .records
            .insert(DeploymentRecord::new(deployment_id, worker_id, attempt))
            .await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let spec = DeploymentSpec::new(descriptor.clone(), params.clone());
        let pipeline = DeploymentPipeline::new(
            spec,
            record,
            self.inner.deps.clone(),
            self.inner.config.pipeline.clone(),
            cancel_rx,
        );

        info!(
            worker_id = %worker_id,
            deployment_id = %deployment_id,
            attempt,
            "Deployment accepted"
        );

        // Replace any existing entry under one lock hold, so two concurrent
        // deploys for the same worker serialize: the new run cancels the
        // prior pipeline and waits for it to settle before touching shared
        // state.
        let mut workers = self.inner.workers.lock().await;
        let prior_task = workers.remove(&worker_id).map(|existing| {
            let _ = existing.cancel.send(true);
            existing.task
        });

        let task = tokio::spawn({
            let orchestrator = self.clone();
            async move {
                if let Some(prior) = prior_task {
                    let _ = prior.await;
                }

                // A health timeout fails this attempt but may warrant a fresh
                // run under the redeploy budget. Boxed dyn future breaks the
                // type cycle between start_pipeline and its own task.
                if let Err(OrchestratorError::HealthTimeout(_)) = pipeline.run().await {
                    let retry: Pin<Box<dyn Future<Output = ()> + Send>> =
                        Box::pin(async move {
                            orchestrator.schedule_redeploy(worker_id).await;
                        });
                    retry.await;
                }
            }
        });

        workers.insert(
            worker_id,
            WorkerEntry {
                descriptor,
                params,
                cancel: cancel_tx,
                task,
                attempt,
            },
        );

        deployment_id
    }
}
