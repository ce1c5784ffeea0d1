//! Shared test harness: in-memory collaborator doubles and a pre-wired
//! orchestrator with fast timings.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aviary_id::{DeploymentId, InstanceId, WorkerId};
use aviary_orchestrator::collaborators::{
    BuildError, CallDispatcher, DispatchError, FetchError, InstanceAddress, ProbeOutcome,
    ReadinessProbe, RuntimeImage, RuntimeLauncher, StartError, TemplateArtifact, TemplateSource,
};
use aviary_orchestrator::core::{Orchestrator, OrchestratorConfig};
use aviary_orchestrator::descriptor::{DeployParams, RuntimeClass, WorkerDescriptor};
use aviary_orchestrator::descriptor::DeploymentSpec;
use aviary_orchestrator::health::HealthConfig;
use aviary_orchestrator::pipeline::PipelineConfig;
use aviary_orchestrator::record::{DeploymentRecord, DeploymentState};
use aviary_orchestrator::router::RouterConfig;
use aviary_provider::{ProviderConfig, ProviderRegistry, ProviderTransport, TransportError};
use aviary_retry::BackoffPolicy;
use bytes::Bytes;
use tokio::sync::watch;

// =============================================================================
// Template source double
// =============================================================================

/// Per-URI scripted behavior for the template source.
#[derive(Debug, Clone)]
pub enum TemplateMode {
    /// Serve the template.
    Ok,
    /// Fail with a transient error this many times, then serve.
    FailTransient(u32),
    /// 404: fatal.
    NotFound,
    /// 5xx forever: transient but never recovers.
    AlwaysServerError,
    /// Hang until the fetch timeout would fire (simulates a stuck source).
    Hang,
}

pub struct MockTemplateSource {
    modes: Mutex<HashMap<String, TemplateMode>>,
    fetch_counts: Mutex<HashMap<String, u32>>,
}

impl MockTemplateSource {
    pub fn new() -> Self {
        Self {
            modes: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, uri: &str, mode: TemplateMode) {
        self.modes.lock().unwrap().insert(uri.to_string(), mode);
    }

    pub fn fetch_count(&self, uri: &str) -> u32 {
        *self.fetch_counts.lock().unwrap().get(uri).unwrap_or(&0)
    }
}

#[async_trait]
impl TemplateSource for MockTemplateSource {
    async fn fetch(&self, uri: &str) -> Result<TemplateArtifact, FetchError> {
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_insert(0) += 1;

        let mode = self
            .modes
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or(TemplateMode::Ok);

        match mode {
            TemplateMode::Ok => Ok(TemplateArtifact {
                uri: uri.to_string(),
                content: Bytes::from_static(b"template"),
            }),
            TemplateMode::FailTransient(remaining) => {
                if remaining > 0 {
                    self.modes
                        .lock()
                        .unwrap()
                        .insert(uri.to_string(), TemplateMode::FailTransient(remaining - 1));
                    Err(FetchError::ServerError { status: 503 })
                } else {
                    Ok(TemplateArtifact {
                        uri: uri.to_string(),
                        content: Bytes::from_static(b"template"),
                    })
                }
            }
            TemplateMode::NotFound => Err(FetchError::NotFound(uri.to_string())),
            TemplateMode::AlwaysServerError => Err(FetchError::ServerError { status: 500 }),
            TemplateMode::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(FetchError::Timeout)
            }
        }
    }
}

// =============================================================================
// Launcher double
// =============================================================================

pub struct MockLauncher {
    instance_counter: AtomicU32,
    fail_next_starts: AtomicU32,
    build_failures: Mutex<HashSet<String>>,
    started: Mutex<Vec<InstanceAddress>>,
    stopped: Mutex<Vec<InstanceAddress>>,
    build_count: AtomicU32,
    start_count: AtomicU32,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            instance_counter: AtomicU32::new(0),
            fail_next_starts: AtomicU32::new(0),
            build_failures: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            build_count: AtomicU32::new(0),
            start_count: AtomicU32::new(0),
        }
    }

    /// Make builds of this image tag fail.
    pub fn fail_builds_of(&self, image_tag: &str) {
        self.build_failures
            .lock()
            .unwrap()
            .insert(image_tag.to_string());
    }

    /// Make the next `n` start calls fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.fail_next_starts.store(n, Ordering::SeqCst);
    }

    pub fn build_count(&self) -> u32 {
        self.build_count.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<InstanceAddress> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<InstanceAddress> {
        self.stopped.lock().unwrap().clone()
    }

    /// Instances started but never stopped.
    pub fn live(&self) -> Vec<InstanceAddress> {
        let stopped = self.stopped.lock().unwrap();
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|a| !stopped.contains(a))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RuntimeLauncher for MockLauncher {
    async fn build(
        &self,
        spec: &DeploymentSpec,
        _artifact: &TemplateArtifact,
    ) -> Result<RuntimeImage, BuildError> {
        self.build_count.fetch_add(1, Ordering::SeqCst);

        if self.build_failures.lock().unwrap().contains(&spec.image_tag) {
            return Err(BuildError {
                reason: "dependency resolution failed".to_string(),
                log_ref: Some(format!("build-log://{}", spec.image_tag)),
            });
        }

        Ok(RuntimeImage {
            reference: format!("img-{}", spec.image_tag),
            build_log: None,
        })
    }

    async fn start(
        &self,
        _image: &RuntimeImage,
        _env: &std::collections::BTreeMap<String, String>,
    ) -> Result<InstanceAddress, StartError> {
        self.start_count.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .fail_next_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StartError::Failed("port bind conflict".to_string()));
        }

        let n = self.instance_counter.fetch_add(1, Ordering::SeqCst);
        let address = InstanceAddress {
            instance_id: InstanceId::new(),
            url: format!("http://worker-{n}"),
        };
        self.started.lock().unwrap().push(address.clone());
        Ok(address)
    }

    async fn stop(&self, address: &InstanceAddress) -> Result<(), StartError> {
        self.stopped.lock().unwrap().push(address.clone());
        Ok(())
    }
}

// =============================================================================
// Probe double
// =============================================================================

pub struct MockProbe {
    default_healthy: bool,
    overrides: Mutex<HashMap<String, bool>>,
}

impl MockProbe {
    /// Instances are healthy by default once started.
    pub fn healthy() -> Self {
        Self {
            default_healthy: true,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Instances never become healthy.
    pub fn never_healthy() -> Self {
        Self {
            default_healthy: false,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, url: &str, healthy: bool) {
        self.overrides
            .lock()
            .unwrap()
            .insert(url.to_string(), healthy);
    }
}

#[async_trait]
impl ReadinessProbe for MockProbe {
    async fn probe(&self, address: &InstanceAddress) -> ProbeOutcome {
        let healthy = self
            .overrides
            .lock()
            .unwrap()
            .get(&address.url)
            .copied()
            .unwrap_or(self.default_healthy);

        if healthy {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy("not ready".to_string())
        }
    }
}

// =============================================================================
// Dispatcher double
// =============================================================================

pub struct MockDispatcher {
    refuse: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self {
            refuse: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn refuse(&self, url: &str) {
        self.refuse.lock().unwrap().insert(url.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls_to(&self, url: &str) -> u32 {
        *self.calls.lock().unwrap().get(url).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl CallDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        address: &InstanceAddress,
        message: &str,
    ) -> Result<String, DispatchError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self
            .calls
            .lock()
            .unwrap()
            .entry(address.url.clone())
            .or_insert(0) += 1;

        if self.refuse.lock().unwrap().contains(&address.url) {
            return Err(DispatchError::Connection {
                address: address.url.clone(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(format!("echo:{message}"))
    }
}

// =============================================================================
// Provider transport double
// =============================================================================

pub struct EchoTransport;

#[async_trait]
impl ProviderTransport for EchoTransport {
    async fn complete(
        &self,
        config: &ProviderConfig,
        input: &str,
    ) -> Result<String, TransportError> {
        Ok(format!("{}:{}", config.model, input))
    }
}

// =============================================================================
// Fleet harness
// =============================================================================

/// Fast timings so whole lifecycles finish in tens of milliseconds.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        pipeline: PipelineConfig {
            fetch_backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
                jitter: 0.0,
            },
            fetch_attempts: 5,
            start_backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
                jitter: 0.0,
            },
            start_attempts: 3,
            build_timeout: Duration::from_secs(5),
            readiness_interval: Duration::from_millis(10),
            readiness_window: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(50),
        },
        health: HealthConfig {
            interval: Duration::from_millis(25),
            probe_timeout: Duration::from_millis(20),
            failure_threshold: 3,
            eviction_intervals: 2,
        },
        router: RouterConfig {
            call_timeout: Duration::from_secs(1),
            failure_threshold: 3,
            allow_degraded: false,
        },
        redeploy_budget: 3,
        redeploy_window: Duration::from_secs(60),
    }
}

/// A fully wired orchestrator over in-memory collaborators.
pub struct TestFleet {
    pub orchestrator: Orchestrator,
    pub templates: Arc<MockTemplateSource>,
    pub launcher: Arc<MockLauncher>,
    pub probe: Arc<MockProbe>,
    pub dispatcher: Arc<MockDispatcher>,
    pub providers: Arc<ProviderRegistry>,
    shutdown: watch::Sender<bool>,
}

impl TestFleet {
    pub async fn spawn() -> Self {
        Self::spawn_with(fast_config(), MockProbe::healthy()).await
    }

    pub async fn spawn_with(config: OrchestratorConfig, probe: MockProbe) -> Self {
        let templates = Arc::new(MockTemplateSource::new());
        let launcher = Arc::new(MockLauncher::new());
        let probe = Arc::new(probe);
        let dispatcher = Arc::new(MockDispatcher::new());
        let providers = Arc::new(ProviderRegistry::new(Arc::new(EchoTransport)));

        let (orchestrator, evictions) = Orchestrator::new(
            Arc::clone(&providers),
            Arc::clone(&templates) as Arc<dyn TemplateSource>,
            Arc::clone(&launcher) as Arc<dyn RuntimeLauncher>,
            Arc::clone(&probe) as Arc<dyn ReadinessProbe>,
            Arc::clone(&dispatcher) as Arc<dyn CallDispatcher>,
            config,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(orchestrator.clone().run_eviction_loop(evictions, shutdown_rx));

        Self {
            orchestrator,
            templates,
            launcher,
            probe,
            dispatcher,
            providers,
            shutdown,
        }
    }

    /// Poll a deployment record until it reaches `state` or the deadline
    /// passes.
    pub async fn wait_for_state(
        &self,
        deployment_id: DeploymentId,
        state: DeploymentState,
        deadline: Duration,
    ) -> DeploymentRecord {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            if let Ok(record) = self.orchestrator.status(deployment_id).await {
                if record.state == state {
                    return record;
                }
                if tokio::time::Instant::now() > end {
                    panic!(
                        "deployment {deployment_id} never reached {state}, last state {} (error: {:?})",
                        record.state, record.last_error
                    );
                }
            } else if tokio::time::Instant::now() > end {
                panic!("deployment {deployment_id} unknown after deadline");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for TestFleet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// A valid descriptor pointing at the mock template source.
pub fn descriptor(name: &str) -> WorkerDescriptor {
    WorkerDescriptor {
        worker_id: WorkerId::new(),
        name: name.to_string(),
        template_uri: format!("https://templates.test/{name}"),
        runtime_class: RuntimeClass::Container,
        env: std::collections::BTreeMap::new(),
        provider_ref: None,
    }
}

pub fn deploy_params() -> DeployParams {
    DeployParams::default()
}
