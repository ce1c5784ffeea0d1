//! Configuration for the orchestrator service.
//!
//! Everything comes from `AVIARY_*` environment variables with sensible
//! defaults, so the binary runs out of the box against a local launcher.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use aviary_retry::BackoffPolicy;

use crate::core::OrchestratorConfig;
use crate::health::HealthConfig;
use crate::pipeline::PipelineConfig;
use crate::router::RouterConfig;

/// Orchestrator service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP control-plane listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Base URL of the runtime launcher daemon.
    pub launcher_url: String,

    /// Template fetch timeout per attempt, in seconds.
    pub fetch_timeout_secs: u64,

    /// Maximum template fetch attempts.
    pub fetch_attempts: u32,

    /// Maximum instance start attempts.
    pub start_attempts: u32,

    /// Build timeout in seconds.
    pub build_timeout_secs: u64,

    /// Readiness wait window in seconds.
    pub readiness_window_secs: u64,

    /// Health probe interval in seconds.
    pub probe_interval_secs: u64,

    /// Per-probe timeout in seconds; must stay below the interval.
    pub probe_timeout_secs: u64,

    /// Consecutive probe failures that demote an endpoint.
    pub failure_threshold: u32,

    /// Demoted intervals before permanent failure.
    pub eviction_intervals: u32,

    /// Per-call dispatch timeout in seconds.
    pub call_timeout_secs: u64,

    /// Whether routing may fall back to degraded endpoints.
    pub allow_degraded_routing: bool,

    /// Automatic redeploys per worker per window.
    pub redeploy_budget: u32,

    /// Redeploy budget window in seconds.
    pub redeploy_window_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("AVIARY_LISTEN_ADDR", "127.0.0.1:8080").parse()?;

        Ok(Self {
            listen_addr,
            log_level: env_or("AVIARY_LOG_LEVEL", "info"),
            launcher_url: env_or("AVIARY_LAUNCHER_URL", "http://127.0.0.1:9000"),
            fetch_timeout_secs: env_parse("AVIARY_FETCH_TIMEOUT", 30),
            fetch_attempts: env_parse("AVIARY_FETCH_ATTEMPTS", 5),
            start_attempts: env_parse("AVIARY_START_ATTEMPTS", 3),
            build_timeout_secs: env_parse("AVIARY_BUILD_TIMEOUT", 300),
            readiness_window_secs: env_parse("AVIARY_READINESS_WINDOW", 60),
            probe_interval_secs: env_parse("AVIARY_PROBE_INTERVAL", 10),
            probe_timeout_secs: env_parse("AVIARY_PROBE_TIMEOUT", 2),
            failure_threshold: env_parse("AVIARY_FAILURE_THRESHOLD", 3),
            eviction_intervals: env_parse("AVIARY_EVICTION_INTERVALS", 5),
            call_timeout_secs: env_parse("AVIARY_CALL_TIMEOUT", 30),
            allow_degraded_routing: env_parse("AVIARY_ALLOW_DEGRADED_ROUTING", false),
            redeploy_budget: env_parse("AVIARY_REDEPLOY_BUDGET", 3),
            redeploy_window_secs: env_parse("AVIARY_REDEPLOY_WINDOW_SECS", 600),
        })
    }

    /// Orchestrator tuning derived from this config.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pipeline: PipelineConfig {
                fetch_backoff: BackoffPolicy {
                    base: Duration::from_secs(1),
                    max: Duration::from_secs(30),
                    jitter: 0.25,
                },
                fetch_attempts: self.fetch_attempts,
                start_backoff: BackoffPolicy {
                    base: Duration::from_secs(1),
                    max: Duration::from_secs(10),
                    jitter: 0.25,
                },
                start_attempts: self.start_attempts,
                build_timeout: Duration::from_secs(self.build_timeout_secs),
                readiness_interval: Duration::from_secs(1),
                readiness_window: Duration::from_secs(self.readiness_window_secs),
                probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            },
            health: HealthConfig {
                interval: Duration::from_secs(self.probe_interval_secs),
                probe_timeout: Duration::from_secs(self.probe_timeout_secs),
                failure_threshold: self.failure_threshold,
                eviction_intervals: self.eviction_intervals,
            },
            router: RouterConfig {
                call_timeout: Duration::from_secs(self.call_timeout_secs),
                failure_threshold: self.failure_threshold,
                allow_degraded: self.allow_degraded_routing,
            },
            redeploy_budget: self.redeploy_budget,
            redeploy_window: Duration::from_secs(self.redeploy_window_secs),
        }
    }
}
