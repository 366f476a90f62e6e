//! Claim election: pick the next runnable item and lock it for a worker.
//!
//! The candidate list is advisory; the authoritative hand-off is the lock
//! acquisition plus the READY -> RUNNING compare-and-transition performed by
//! the worker. Losing either race is normal and skipped silently.

use chrono::{DateTime, Utc};

use labelsquor_workflow::{Result, WorkItemState};

use crate::lock::{LockLease, LockManager};
use crate::store::SqliteWorkflowStore;
use std::sync::Arc;

const DISPATCH_SCAN_LIMIT: usize = 16;

/// A locked claim handed to a worker. `reclaim` marks an item found RUNNING
/// with a lapsed lease: its previous owner died mid-stage.
pub struct Claim {
    pub lease: LockLease,
    pub reclaim: bool,
}

pub struct Scheduler {
    store: Arc<SqliteWorkflowStore>,
    lock: LockManager,
}

impl Scheduler {
    pub fn new(store: Arc<SqliteWorkflowStore>, lock: LockManager) -> Self {
        Self { store, lock }
    }

    /// Elect and lock at most one item for `worker_id`. Candidates that lose
    /// the lock race to another worker are skipped in order.
    pub fn dispatch_one(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Claim>> {
        let candidates = self.store.list_dispatchable(now, DISPATCH_SCAN_LIMIT)?;
        for candidate in candidates {
            match self.lock.acquire(&candidate.work_item_id, worker_id, now) {
                Ok(lease) => {
                    let reclaim = candidate.state == WorkItemState::Running;
                    return Ok(Some(Claim { lease, reclaim }));
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::store::TransitionRequest;

    fn fixture() -> (Arc<SqliteWorkflowStore>, Scheduler) {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-sched-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let lock = LockManager::new(Arc::clone(&store), Duration::seconds(300));
        let scheduler = Scheduler::new(Arc::clone(&store), lock);
        (store, scheduler)
    }

    fn enqueue(store: &SqliteWorkflowStore, id: &str, priority: i64, now: DateTime<Utc>) {
        store.insert_work_item(id, &json!({}), priority, now).unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    id,
                    0,
                    WorkItemState::Created,
                    WorkItemState::Ready,
                    "enqueued",
                    "ingress",
                ),
                now,
            )
            .unwrap();
    }

    #[test]
    fn highest_priority_ready_item_wins() {
        let (store, scheduler) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        enqueue(&store, "low", 1, now);
        enqueue(&store, "high", 8, now);

        let claim = scheduler.dispatch_one("w1", now).unwrap().expect("claim");
        assert_eq!(claim.lease.work_item_id(), "high");
        assert!(!claim.reclaim);
    }

    #[test]
    fn locked_candidates_are_skipped_in_order() {
        let (store, scheduler) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        enqueue(&store, "first", 5, now);
        enqueue(&store, "second", 4, now);

        let a = scheduler.dispatch_one("w1", now).unwrap().expect("first claim");
        assert_eq!(a.lease.work_item_id(), "first");
        let b = scheduler.dispatch_one("w2", now).unwrap().expect("second claim");
        assert_eq!(b.lease.work_item_id(), "second");
        assert!(scheduler.dispatch_one("w3", now).unwrap().is_none());
    }

    #[test]
    fn expired_running_item_is_a_reclaim() {
        let (store, scheduler) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        enqueue(&store, "wi-1", 5, now);
        // A short-leased worker claims it, transitions to RUNNING, then dies.
        let short_lock = LockManager::new(Arc::clone(&store), Duration::seconds(1));
        short_lock.acquire("wi-1", "w-dead", now).unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    "wi-1",
                    1,
                    WorkItemState::Ready,
                    WorkItemState::Running,
                    "claimed",
                    "w-dead",
                ),
                now,
            )
            .unwrap();

        assert!(scheduler.dispatch_one("w2", now).unwrap().is_none());
        let later = now + Duration::seconds(2);
        let claim = scheduler.dispatch_one("w2", later).unwrap().expect("reclaim");
        assert_eq!(claim.lease.work_item_id(), "wi-1");
        assert!(claim.reclaim);
    }
}
