//! HTTP readiness probe.

use std::time::Duration;

use async_trait::async_trait;

use super::{InstanceAddress, ProbeOutcome, ReadinessProbe};

/// Default per-probe timeout. Must stay shorter than the probe interval so a
/// hanging instance cannot delay its own next probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes `GET {instance}/health`; 200 means healthy, everything else
/// (including timeouts) means unhealthy.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReadinessProbe {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpReadinessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(&self, address: &InstanceAddress) -> ProbeOutcome {
        let result = self
            .client
            .get(format!("{}/health", address.url))
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Unhealthy(format!("status {}", response.status())),
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy("probe timed out".to_string()),
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }
}
