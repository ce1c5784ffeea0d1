//! Worker router: the live set of routable endpoints and call dispatch.
//!
//! One pool per logical worker; a worker may have 1..N replica endpoints.
//! Selection is round-robin among healthy endpoints, with an optional
//! degraded fallback that picks the least-recently-failed endpoint when no
//! healthy one exists.
//!
//! Pool mutations (register/deregister/probe results) take the pool's write
//! lock, so a concurrent `route` either sees an endpoint entirely or not at
//! all, and a demotion is visible to routing before the demoting call
//! returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aviary_id::{EndpointId, WorkerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::collaborators::{CallDispatcher, DispatchError, InstanceAddress};
use crate::error::OrchestratorError;

/// Default bound on one routed call, failover included.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A routable endpoint for one worker replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint_id: EndpointId,
    pub worker_id: WorkerId,
    pub address: InstanceAddress,
}

impl Endpoint {
    pub fn new(worker_id: WorkerId, address: InstanceAddress) -> Self {
        Self {
            endpoint_id: EndpointId::new(),
            worker_id,
            address,
        }
    }
}

/// Serializable endpoint view for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub endpoint_id: EndpointId,
    pub worker_id: WorkerId,
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Internal state for an endpoint in a pool.
struct EndpointState {
    endpoint: Endpoint,
    healthy: bool,
    consecutive_failures: u32,
    last_probe_at: Option<DateTime<Utc>>,
    last_failure: Option<Instant>,
}

impl EndpointState {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            healthy: true,
            consecutive_failures: 0,
            last_probe_at: None,
            last_failure: None,
        }
    }

    fn info(&self) -> EndpointInfo {
        EndpointInfo {
            endpoint_id: self.endpoint.endpoint_id,
            worker_id: self.endpoint.worker_id,
            url: self.endpoint.address.url.clone(),
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            last_probe_at: self.last_probe_at,
        }
    }
}

/// Pool of replica endpoints for one logical worker.
pub struct EndpointPool {
    worker_id: WorkerId,
    endpoints: RwLock<Vec<EndpointState>>,
    rr_counter: AtomicUsize,
}

impl EndpointPool {
    fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            endpoints: RwLock::new(Vec::new()),
            rr_counter: AtomicUsize::new(0),
        }
    }

    async fn register(&self, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.write().await;
        debug!(
            worker_id = %self.worker_id,
            endpoint_id = %endpoint.endpoint_id,
            url = %endpoint.address.url,
            "Endpoint registered"
        );
        endpoints.push(EndpointState::new(endpoint));
    }

    async fn deregister(&self, endpoint_id: EndpointId) -> Option<Endpoint> {
        let mut endpoints = self.endpoints.write().await;
        let idx = endpoints
            .iter()
            .position(|s| s.endpoint.endpoint_id == endpoint_id)?;
        let state = endpoints.swap_remove(idx);
        debug!(
            worker_id = %self.worker_id,
            endpoint_id = %endpoint_id,
            "Endpoint deregistered"
        );
        Some(state.endpoint)
    }

    /// Record a failed probe or dispatch against an endpoint.
    ///
    /// Reaching `threshold` consecutive failures demotes the endpoint; the
    /// demotion happens under the pool write lock, so it is visible to every
    /// subsequent `route` before this returns. Returns the new failure count,
    /// or `None` if the endpoint is no longer in the pool.
    pub async fn record_failure(&self, endpoint_id: EndpointId, threshold: u32) -> Option<u32> {
        let mut endpoints = self.endpoints.write().await;
        let state = endpoints
            .iter_mut()
            .find(|s| s.endpoint.endpoint_id == endpoint_id)?;

        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        state.last_probe_at = Some(Utc::now());

        if state.consecutive_failures >= threshold && state.healthy {
            state.healthy = false;
            warn!(
                worker_id = %self.worker_id,
                endpoint_id = %endpoint_id,
                consecutive_failures = state.consecutive_failures,
                "Endpoint demoted from routable set"
            );
        }

        Some(state.consecutive_failures)
    }

    /// Record a successful probe, restoring routability after transient
    /// blips. Returns whether the endpoint was previously demoted.
    pub async fn record_success(&self, endpoint_id: EndpointId) -> Option<bool> {
        let mut endpoints = self.endpoints.write().await;
        let state = endpoints
            .iter_mut()
            .find(|s| s.endpoint.endpoint_id == endpoint_id)?;

        let was_demoted = !state.healthy;
        state.healthy = true;
        state.consecutive_failures = 0;
        state.last_probe_at = Some(Utc::now());

        if was_demoted {
            debug!(
                worker_id = %self.worker_id,
                endpoint_id = %endpoint_id,
                "Endpoint restored to routable set"
            );
        }

        Some(was_demoted)
    }

    /// Select one endpoint: round-robin among healthy ones, optionally
    /// falling back to the least-recently-failed degraded endpoint.
    async fn select(&self, exclude: Option<EndpointId>, allow_degraded: bool) -> Option<Endpoint> {
        let endpoints = self.endpoints.read().await;

        let healthy: Vec<&EndpointState> = endpoints
            .iter()
            .filter(|s| s.healthy && Some(s.endpoint.endpoint_id) != exclude)
            .collect();

        if !healthy.is_empty() {
            let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
            return Some(healthy[idx].endpoint.clone());
        }

        if !allow_degraded {
            return None;
        }

        // Degraded fallback: the endpoint that failed longest ago.
        endpoints
            .iter()
            .filter(|s| Some(s.endpoint.endpoint_id) != exclude)
            .max_by_key(|s| s.last_failure.map(|t| t.elapsed()))
            .map(|s| s.endpoint.clone())
    }

    pub async fn healthy_count(&self) -> usize {
        self.endpoints.read().await.iter().filter(|s| s.healthy).count()
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<EndpointInfo> {
        self.endpoints.read().await.iter().map(|s| s.info()).collect()
    }

    async fn all_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|s| s.endpoint.clone())
            .collect()
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-call dispatch bound, distinct from the probe timeout.
    pub call_timeout: Duration,

    /// Consecutive failures that demote an endpoint.
    pub failure_threshold: u32,

    /// Whether routing may fall back to degraded endpoints when no healthy
    /// one exists.
    pub allow_degraded: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            failure_threshold: 3,
            allow_degraded: false,
        }
    }
}

/// Routes calls to healthy worker endpoints.
pub struct WorkerRouter {
    pools: RwLock<HashMap<WorkerId, Arc<EndpointPool>>>,
    dispatcher: Arc<dyn CallDispatcher>,
    config: RouterConfig,
}

impl WorkerRouter {
    pub fn new(dispatcher: Arc<dyn CallDispatcher>, config: RouterConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            dispatcher,
            config,
        }
    }

    /// Get or create the pool for a worker.
    pub async fn pool(&self, worker_id: WorkerId) -> Arc<EndpointPool> {
        // Fast path: read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&worker_id) {
                return Arc::clone(pool);
            }
        }

        // Slow path: write lock
        let mut pools = self.pools.write().await;
        pools
            .entry(worker_id)
            .or_insert_with(|| Arc::new(EndpointPool::new(worker_id)))
            .clone()
    }

    /// Pool lookup without creating one.
    pub async fn get_pool(&self, worker_id: WorkerId) -> Option<Arc<EndpointPool>> {
        self.pools.read().await.get(&worker_id).cloned()
    }

    /// Publish an endpoint into the routable set.
    pub async fn register(&self, endpoint: Endpoint) {
        let pool = self.pool(endpoint.worker_id).await;
        pool.register(endpoint).await;
    }

    /// Remove one endpoint from the routable set.
    pub async fn deregister(&self, worker_id: WorkerId, endpoint_id: EndpointId) -> Option<Endpoint> {
        let pool = self.get_pool(worker_id).await?;
        pool.deregister(endpoint_id).await
    }

    /// Drop a worker's pool entirely. Returns the endpoints it held.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> Vec<Endpoint> {
        let pool = {
            let mut pools = self.pools.write().await;
            pools.remove(&worker_id)
        };
        match pool {
            Some(pool) => pool.all_endpoints().await,
            None => Vec::new(),
        }
    }

    /// Route one call to a healthy endpoint for the worker.
    ///
    /// A connection-level dispatch failure marks the endpoint (feeding the
    /// health monitor's failure counts) and fails over at most once to a
    /// different healthy endpoint before surfacing the error.
    pub async fn route(&self, worker_id: WorkerId, message: &str) -> Result<String, OrchestratorError> {
        let pool = self
            .get_pool(worker_id)
            .await
            .ok_or(OrchestratorError::NoHealthyEndpoint(worker_id))?;

        let endpoint = pool
            .select(None, self.config.allow_degraded)
            .await
            .ok_or(OrchestratorError::NoHealthyEndpoint(worker_id))?;

        match self.dispatch_once(&endpoint, message).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_endpoint_failure() => {
                warn!(
                    worker_id = %worker_id,
                    endpoint_id = %endpoint.endpoint_id,
                    error = %err,
                    "Dispatch failed, attempting failover"
                );
                pool.record_failure(endpoint.endpoint_id, self.config.failure_threshold)
                    .await;

                // Never the same endpoint twice; one alternate at most.
                let alternate = pool
                    .select(Some(endpoint.endpoint_id), false)
                    .await
                    .ok_or(OrchestratorError::Dispatch(err))?;

                match self.dispatch_once(&alternate, message).await {
                    Ok(response) => Ok(response),
                    Err(second) => {
                        if second.is_endpoint_failure() {
                            pool.record_failure(
                                alternate.endpoint_id,
                                self.config.failure_threshold,
                            )
                            .await;
                        }
                        Err(OrchestratorError::Dispatch(second))
                    }
                }
            }
            Err(err) => Err(OrchestratorError::Dispatch(err)),
        }
    }

    async fn dispatch_once(
        &self,
        endpoint: &Endpoint,
        message: &str,
    ) -> Result<String, DispatchError> {
        match timeout(
            self.config.call_timeout,
            self.dispatcher.dispatch(&endpoint.address, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                address: endpoint.address.url.clone(),
            }),
        }
    }

    /// Endpoint views for one worker.
    pub async fn endpoints(&self, worker_id: WorkerId) -> Vec<EndpointInfo> {
        match self.get_pool(worker_id).await {
            Some(pool) => pool.snapshot().await,
            None => Vec::new(),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.config.failure_threshold
    }
}
