//! Lease-based distributed mutual exclusion per work item.
//!
//! Exclusivity is enforced by the store's acquire-if-free primitive, never by
//! clock comparison here. A [LockLease] must be extended while a stage is
//! executing; if the owning process dies the lease lapses and the item
//! becomes reclaimable through normal dispatch.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use labelsquor_workflow::Result;

use crate::models::WorkItem;
use crate::store::SqliteWorkflowStore;

#[derive(Clone)]
pub struct LockManager {
    store: Arc<SqliteWorkflowStore>,
    lease: Duration,
}

impl LockManager {
    pub fn new(store: Arc<SqliteWorkflowStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Extension cadence while a stage runs: a third of the lease, so two
    /// missed beats still leave slack before expiry.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        let ms = (self.lease.num_milliseconds() / 3).max(1000) as u64;
        std::time::Duration::from_millis(ms)
    }

    /// Claim the item for `worker_id`. Succeeds iff no live lease exists.
    pub fn acquire(
        &self,
        work_item_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LockLease> {
        let item = self
            .store
            .acquire_lock(work_item_id, worker_id, self.lease, now)?;
        Ok(LockLease {
            store: Arc::clone(&self.store),
            work_item_id: work_item_id.to_string(),
            worker_id: worker_id.to_string(),
            lease: self.lease,
            item,
        })
    }
}

/// A held lease. Dropping it does not release the lock; callers release
/// explicitly so an in-flight transition is never raced by its own cleanup.
pub struct LockLease {
    store: Arc<SqliteWorkflowStore>,
    work_item_id: String,
    worker_id: String,
    lease: Duration,
    item: WorkItem,
}

impl LockLease {
    pub fn work_item_id(&self) -> &str {
        &self.work_item_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Snapshot taken at acquisition time.
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Push the expiry out by a full lease. `Conflict` means the lease was
    /// lost to reclamation and the holder must abandon the item.
    pub fn extend(&self, now: DateTime<Utc>) -> Result<()> {
        self.store
            .extend_lock(&self.work_item_id, &self.worker_id, self.lease, now)
    }

    /// Release if still the holder; returns whether a lock was released.
    pub fn release(&self, now: DateTime<Utc>) -> Result<bool> {
        self.store
            .release_lock(&self.work_item_id, &self.worker_id, now)
    }
}
