//! Health monitor: per-endpoint probe loops, demotion, and eviction.
//!
//! Each watched endpoint gets its own probe task, so one hanging instance
//! never delays probes of the others; every probe call is additionally
//! bounded by a timeout shorter than the probe interval.
//!
//! Probe results feed the router pool's failure counters. Demotion happens
//! inside the pool (atomically with respect to routing); this module decides
//! *when* an endpoint has been unhealthy long enough to be permanently
//! failed, at which point it deregisters the endpoint and forwards an
//! eviction notice to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aviary_id::EndpointId;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::collaborators::{ProbeOutcome, ReadinessProbe};
use crate::router::{Endpoint, WorkerRouter};

/// Health monitoring configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probes of one endpoint.
    pub interval: Duration,

    /// Bound on a single probe call. Must be shorter than `interval`.
    pub probe_timeout: Duration,

    /// Consecutive failures that demote an endpoint from routing.
    pub failure_threshold: u32,

    /// Demoted intervals after which the endpoint is permanently failed.
    pub eviction_intervals: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            eviction_intervals: 5,
        }
    }
}

/// Notice that an endpoint was permanently failed and removed.
///
/// The orchestrator decides whether the worker gets a fresh pipeline run.
#[derive(Debug, Clone)]
pub struct EvictionNotice {
    pub endpoint: Endpoint,
}

/// Monitors registered endpoints and keeps the router's routable set honest.
pub struct HealthMonitor {
    router: Arc<WorkerRouter>,
    probe: Arc<dyn ReadinessProbe>,
    config: HealthConfig,
    evictions: mpsc::Sender<EvictionNotice>,
    watchers: Arc<Mutex<HashMap<EndpointId, watch::Sender<bool>>>>,
}

impl HealthMonitor {
    /// Create a monitor and the eviction channel the orchestrator consumes.
    pub fn new(
        router: Arc<WorkerRouter>,
        probe: Arc<dyn ReadinessProbe>,
        config: HealthConfig,
    ) -> (Self, mpsc::Receiver<EvictionNotice>) {
        let (evictions, rx) = mpsc::channel(64);
        (
            Self {
                router,
                probe,
                config,
                evictions,
                watchers: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Start a probe loop for an endpoint.
    pub async fn watch(&self, endpoint: Endpoint) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut watchers = self.watchers.lock().await;
            watchers.insert(endpoint.endpoint_id, shutdown_tx);
        }

        debug!(
            worker_id = %endpoint.worker_id,
            endpoint_id = %endpoint.endpoint_id,
            "Health watch started"
        );

        tokio::spawn(run_probe_loop(
            endpoint,
            Arc::clone(&self.router),
            Arc::clone(&self.probe),
            self.config.clone(),
            self.evictions.clone(),
            Arc::clone(&self.watchers),
            shutdown_rx,
        ));
    }

    /// Stop the probe loop for an endpoint.
    pub async fn unwatch(&self, endpoint_id: EndpointId) {
        let mut watchers = self.watchers.lock().await;
        if let Some(tx) = watchers.remove(&endpoint_id) {
            let _ = tx.send(true);
            debug!(endpoint_id = %endpoint_id, "Health watch stopped");
        }
    }

    /// Stop every probe loop (process shutdown).
    pub async fn unwatch_all(&self) {
        let mut watchers = self.watchers.lock().await;
        for (_, tx) in watchers.drain() {
            let _ = tx.send(true);
        }
    }
}

async fn run_probe_loop(
    endpoint: Endpoint,
    router: Arc<WorkerRouter>,
    probe: Arc<dyn ReadinessProbe>,
    config: HealthConfig,
    evictions: mpsc::Sender<EvictionNotice>,
    watchers: Arc<Mutex<HashMap<EndpointId, watch::Sender<bool>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    let mut demoted_ticks = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = match timeout(config.probe_timeout, probe.probe(&endpoint.address)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Unhealthy("probe timed out".to_string()),
                };

                // Pool gone means the worker was torn down under us.
                let Some(pool) = router.get_pool(endpoint.worker_id).await else {
                    break;
                };

                match outcome {
                    ProbeOutcome::Healthy => {
                        if pool.record_success(endpoint.endpoint_id).await.is_none() {
                            break;
                        }
                        demoted_ticks = 0;
                    }
                    ProbeOutcome::Unhealthy(reason) => {
                        let Some(failures) = pool
                            .record_failure(endpoint.endpoint_id, config.failure_threshold)
                            .await
                        else {
                            break;
                        };

                        warn!(
                            worker_id = %endpoint.worker_id,
                            endpoint_id = %endpoint.endpoint_id,
                            consecutive_failures = failures,
                            reason = %reason,
                            "Probe failed"
                        );

                        if failures >= config.failure_threshold {
                            demoted_ticks += 1;

                            if demoted_ticks >= config.eviction_intervals {
                                info!(
                                    worker_id = %endpoint.worker_id,
                                    endpoint_id = %endpoint.endpoint_id,
                                    "Endpoint permanently failed, evicting"
                                );

                                router
                                    .deregister(endpoint.worker_id, endpoint.endpoint_id)
                                    .await;

                                if evictions
                                    .send(EvictionNotice {
                                        endpoint: endpoint.clone(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    warn!("Eviction channel closed, notice dropped");
                                }
                                break;
                            }
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Drop our own shutdown handle so `unwatch` of a finished loop is a no-op.
    let mut watchers = watchers.lock().await;
    watchers.remove(&endpoint.endpoint_id);
}
