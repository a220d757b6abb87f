//! Apply lanes: events are routed by document id so that every event for one
//! id is applied by the same single-threaded lane, in arrival order.

use kubist_apply::{ApplyError, ApplyOutcome, Applier};
use kubist_core::{Delta, LanePlanner};
use kubist_store::DocumentStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Per-outcome apply counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub absent: u64,
    pub conflicts: u64,
}

impl ApplyCounts {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created { .. } => self.created += 1,
            ApplyOutcome::Updated { .. } => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::Absent => self.absent += 1,
            ApplyOutcome::Conflict(_) => self.conflicts += 1,
        }
    }

    pub fn merge(&mut self, other: &ApplyCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.absent += other.absent;
        self.conflicts += other.conflicts;
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.deleted + self.unchanged + self.absent + self.conflicts
    }
}

/// A lane exited because it failed; its error is reported separately.
#[derive(Debug, thiserror::Error)]
#[error("apply lane {0} is gone")]
pub struct LaneClosed(pub usize);

pub struct ApplyPool {
    planner: LanePlanner,
    lanes: Vec<mpsc::Sender<Delta>>,
    tasks: JoinSet<ApplyCounts>,
}

impl ApplyPool {
    /// Start one lane per planner slot. The returned receiver yields the first
    /// fatal error of each failed lane.
    pub fn spawn<S>(applier: Applier<S>, planner: LanePlanner, capacity: usize) -> (Self, mpsc::Receiver<ApplyError>)
    where
        S: DocumentStore + ?Sized + 'static,
    {
        let (err_tx, err_rx) = mpsc::channel(planner.lanes());
        let mut tasks = JoinSet::new();
        let mut lanes = Vec::with_capacity(planner.lanes());
        for lane in 0..planner.lanes() {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            lanes.push(tx);
            tasks.spawn(run_lane(lane, applier.clone(), rx, err_tx.clone()));
        }
        info!(lanes = planner.lanes(), capacity, "apply lanes started");
        (Self { planner, lanes, tasks }, err_rx)
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Queue `delta` on its lane, waiting if that lane is full.
    pub async fn dispatch(&self, delta: Delta) -> Result<(), LaneClosed> {
        let lane = self.planner.lane(&delta.document_id());
        self.lanes[lane].send(delta).await.map_err(|_| LaneClosed(lane))
    }

    /// Close every lane, let each drain what it has queued, and sum the counts.
    pub async fn shutdown(mut self) -> ApplyCounts {
        self.lanes.clear();
        let mut total = ApplyCounts::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(counts) => total.merge(&counts),
                Err(e) => error!(error = %e, "apply lane task panicked"),
            }
        }
        total
    }
}

async fn run_lane<S>(lane: usize, applier: Applier<S>, mut rx: mpsc::Receiver<Delta>, errors: mpsc::Sender<ApplyError>) -> ApplyCounts
where
    S: DocumentStore + ?Sized + 'static,
{
    let mut counts = ApplyCounts::default();
    while let Some(delta) = rx.recv().await {
        match applier.apply(&delta).await {
            Ok(outcome) => counts.record(&outcome),
            Err(e) => {
                error!(lane, error = %e, "apply lane failed");
                // one slot per lane, and each lane reports at most once
                let _ = errors.try_send(e);
                break;
            }
        }
    }
    debug!(lane, applied = counts.total(), "apply lane stopped");
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubist_core::{DeltaKind, ResourceObject};
    use kubist_store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn pod(name: &str, rv: &str) -> Delta {
        let obj = ResourceObject::from_json(
            "Pod",
            json!({"metadata": {"name": name, "namespace": "ns", "resourceVersion": rv}}),
        )
        .unwrap();
        Delta::new(DeltaKind::Updated, obj)
    }

    #[tokio::test]
    async fn same_id_events_apply_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (pool, _errors) = ApplyPool::spawn(Applier::new(store.clone()), LanePlanner::new(4), 8);
        for rv in 1..=50 {
            pool.dispatch(pod("a", &rv.to_string())).await.unwrap();
            pool.dispatch(pod("b", &rv.to_string())).await.unwrap();
        }
        let counts = pool.shutdown().await;
        assert_eq!(counts.conflicts, 0);
        assert_eq!(counts.created + counts.updated, 100);
        for id in ["Pod/ns/a", "Pod/ns/b"] {
            assert_eq!(store.snapshot(id).unwrap().resource_version(), Some("50"));
        }
    }

    #[tokio::test]
    async fn failed_lane_reports_its_error() {
        let store = Arc::new(MemoryStore::new());
        let (pool, mut errors) = ApplyPool::spawn(Applier::new(store), LanePlanner::new(1), 8);
        pool.dispatch(pod("a", "1")).await.unwrap();
        pool.dispatch(pod("a", "x1")).await.unwrap();
        let err = errors.recv().await.unwrap();
        assert!(matches!(err, ApplyError::Version { .. }));
        let counts = pool.shutdown().await;
        assert_eq!(counts.created, 1);
    }
}
