//! # aviary-retry
//!
//! Retry primitives shared across the fleet:
//!
//! - [`BackoffPolicy`]: capped exponential backoff with jitter, used for
//!   transient stage failures inside a single deployment pipeline run.
//! - [`RetryBudget`]: a windowed failure counter, used by the orchestrator to
//!   bound how often a whole pipeline may be re-run for one worker.
//!
//! Both are plain data; callers decide when to sleep and when to give up.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given retry attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Windowed retry budget keyed by resource.
///
/// Failures older than the window no longer count against the budget, so a
/// worker that was flapping an hour ago gets a fresh allowance today.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Maximum retries per resource inside the window.
    max_retries: u32,

    /// Sliding window duration.
    window: Duration,

    /// Tracked failures: resource key -> (count, first failure time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryBudget {
    /// Create a new budget.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if the budget is now exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check whether the budget is exhausted for a resource.
    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear tracking for a resource (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune entries whose window has elapsed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default number of automatic redeploys per worker per window.
pub const DEFAULT_REDEPLOY_BUDGET: u32 = 3;

/// Default redeploy budget window.
pub const DEFAULT_REDEPLOY_WINDOW: Duration = Duration::from_secs(10 * 60);
