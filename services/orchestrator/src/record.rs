//! Deployment records: the per-attempt state machine and the shared table.
//!
//! ## State Machine
//!
//! ```text
//! pending -> resolving -> fetching -> building -> starting -> health_checking -> running
//!     |          |           |           |           |              |              |
//!     +----------+-----------+------- failed <-------+--------------+--------------+
//!
//! running | failed -> stopped
//! ```
//!
//! Terminal records (`running`, `failed`, `stopped`) are retained for audit
//! until explicit garbage collection.

use std::collections::HashMap;
use std::sync::Arc;

use aviary_id::{DeploymentId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

/// Phase of one deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Resolving,
    Fetching,
    Building,
    Starting,
    HealthChecking,
    Running,
    Failed,
    Stopped,
}

impl DeploymentState {
    /// States retained for audit; no forward progress happens from these
    /// except explicit stop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }

    /// Whether the machine permits `self -> next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeploymentState::*;

        match (self, next) {
            (Pending, Resolving)
            | (Resolving, Fetching)
            | (Fetching, Building)
            | (Building, Starting)
            | (Starting, HealthChecking)
            | (HealthChecking, Running) => true,

            // Errors exit to Failed from anywhere except Failed/Stopped.
            // Running can still fail: a live instance that is evicted after
            // repeated health failures ends its record here.
            (from, Failed) if !matches!(from, Failed | Stopped) => true,

            (Running | Failed, Stopped) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::HealthChecking => "health_checking",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Audit/state object for one deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: DeploymentId,
    pub worker_id: WorkerId,
    pub state: DeploymentState,
    pub started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,

    /// 1-based attempt count across pipeline re-runs for this worker.
    pub attempt: u32,

    /// The error that drove the record to `failed`, retained for audit.
    pub last_error: Option<String>,
}

impl DeploymentRecord {
    pub fn new(deployment_id: DeploymentId, worker_id: WorkerId, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            deployment_id,
            worker_id,
            state: DeploymentState::Pending,
            started_at: now,
            last_transition_at: now,
            attempt,
            last_error: None,
        }
    }

    /// Apply a state transition, refusing illegal ones.
    ///
    /// Returns whether the transition was applied. An illegal transition is a
    /// pipeline bug; it is logged and ignored rather than corrupting the
    /// record.
    pub fn transition(&mut self, next: DeploymentState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                deployment_id = %self.deployment_id,
                from = %self.state,
                to = %next,
                "Illegal deployment state transition refused"
            );
            return false;
        }

        self.state = next;
        self.last_transition_at = Utc::now();
        true
    }

    /// Move to `failed`, retaining the triggering error.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.last_error = Some(error.to_string());
        self.transition(DeploymentState::Failed);
    }
}

/// Shared table of deployment records.
///
/// Entries are `Arc<RwLock<_>>` so writers lock one record at a time;
/// deployments for unrelated workers never contend.
pub struct DeploymentTable {
    records: RwLock<HashMap<DeploymentId, Arc<RwLock<DeploymentRecord>>>>,
    latest_by_worker: RwLock<HashMap<WorkerId, DeploymentId>>,
}

impl DeploymentTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            latest_by_worker: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a fresh record and make it the worker's latest.
    pub async fn insert(&self, record: DeploymentRecord) -> Arc<RwLock<DeploymentRecord>> {
        let deployment_id = record.deployment_id;
        let worker_id = record.worker_id;
        let entry = Arc::new(RwLock::new(record));

        self.records
            .write()
            .await
            .insert(deployment_id, Arc::clone(&entry));
        self.latest_by_worker
            .write()
            .await
            .insert(worker_id, deployment_id);

        entry
    }

    pub async fn get(&self, deployment_id: DeploymentId) -> Option<Arc<RwLock<DeploymentRecord>>> {
        self.records.read().await.get(&deployment_id).cloned()
    }

    /// Point-in-time copy of a record.
    pub async fn snapshot(&self, deployment_id: DeploymentId) -> Option<DeploymentRecord> {
        let entry = self.get(deployment_id).await?;
        let record = entry.read().await;
        Some(record.clone())
    }

    /// The most recent record for a worker, if any.
    pub async fn latest_for_worker(&self, worker_id: WorkerId) -> Option<DeploymentRecord> {
        let deployment_id = *self.latest_by_worker.read().await.get(&worker_id)?;
        self.snapshot(deployment_id).await
    }

    /// Writable handle to the most recent record for a worker.
    pub async fn latest_entry_for_worker(
        &self,
        worker_id: WorkerId,
    ) -> Option<Arc<RwLock<DeploymentRecord>>> {
        let deployment_id = *self.latest_by_worker.read().await.get(&worker_id)?;
        self.get(deployment_id).await
    }

    /// Drop terminal records that are no longer any worker's latest.
    ///
    /// Returns the number of records collected.
    pub async fn gc(&self) -> usize {
        let latest: Vec<DeploymentId> = self
            .latest_by_worker
            .read()
            .await
            .values()
            .copied()
            .collect();

        let mut records = self.records.write().await;
        let mut collected = 0;

        let ids: Vec<DeploymentId> = records.keys().copied().collect();
        for id in ids {
            if latest.contains(&id) {
                continue;
            }
            let terminal = {
                let Some(entry) = records.get(&id) else {
                    continue;
                };
                entry.read().await.state.is_terminal()
            };
            if terminal {
                records.remove(&id);
                collected += 1;
            }
        }

        collected
    }
}

impl Default for DeploymentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::DeploymentState::*;
    use super::*;

    #[rstest]
    #[case(Pending, Resolving, true)]
    #[case(Resolving, Fetching, true)]
    #[case(Fetching, Building, true)]
    #[case(Building, Starting, true)]
    #[case(Starting, HealthChecking, true)]
    #[case(HealthChecking, Running, true)]
    #[case(Pending, Fetching, false)]
    #[case(Fetching, Starting, false)]
    #[case(Running, Resolving, false)]
    fn forward_transitions(
        #[case] from: DeploymentState,
        #[case] to: DeploymentState,
        #[case] legal: bool,
    ) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[rstest]
    #[case(Pending)]
    #[case(Fetching)]
    #[case(Starting)]
    #[case(HealthChecking)]
    #[case(Running)]
    fn any_live_state_can_fail(#[case] from: DeploymentState) {
        assert!(from.can_transition_to(Failed));
    }

    #[rstest]
    #[case(Running, true)]
    #[case(Failed, true)]
    #[case(Pending, false)]
    #[case(HealthChecking, false)]
    fn stopped_only_from_running_or_failed(#[case] from: DeploymentState, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(Stopped), legal);
    }

    #[test]
    fn failed_and_stopped_are_sinks_for_failure() {
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn record_refuses_illegal_transition() {
        let mut record = DeploymentRecord::new(DeploymentId::new(), WorkerId::new(), 1);

        assert!(record.transition(Resolving));
        assert!(!record.transition(Running));
        assert_eq!(record.state, Resolving);
    }

    #[test]
    fn fail_retains_error() {
        let mut record = DeploymentRecord::new(DeploymentId::new(), WorkerId::new(), 1);
        record.transition(Resolving);
        record.fail("invalid descriptor: empty name");

        assert_eq!(record.state, Failed);
        assert_eq!(
            record.last_error.as_deref(),
            Some("invalid descriptor: empty name")
        );
    }

    #[tokio::test]
    async fn table_tracks_latest_per_worker() {
        let table = DeploymentTable::new();
        let worker_id = WorkerId::new();

        let first = DeploymentRecord::new(DeploymentId::new(), worker_id, 1);
        let first_id = first.deployment_id;
        table.insert(first).await;

        let second = DeploymentRecord::new(DeploymentId::new(), worker_id, 2);
        let second_id = second.deployment_id;
        table.insert(second).await;

        let latest = table.latest_for_worker(worker_id).await.unwrap();
        assert_eq!(latest.deployment_id, second_id);

        // Both records remain until gc.
        assert!(table.snapshot(first_id).await.is_some());
    }

    #[tokio::test]
    async fn gc_drops_only_superseded_terminal_records() {
        let table = DeploymentTable::new();
        let worker_id = WorkerId::new();

        let mut old = DeploymentRecord::new(DeploymentId::new(), worker_id, 1);
        old.transition(Resolving);
        old.fail("fetch failed");
        let old_id = old.deployment_id;
        table.insert(old).await;

        let current = DeploymentRecord::new(DeploymentId::new(), worker_id, 2);
        let current_id = current.deployment_id;
        table.insert(current).await;

        assert_eq!(table.gc().await, 1);
        assert!(table.snapshot(old_id).await.is_none());
        assert!(table.snapshot(current_id).await.is_some());
    }
}
