//! Worker loop and pool.
//!
//! Each worker is a linear actor: claim, lock, READY -> RUNNING, run the
//! stage, map the outcome to a transition, unlock, loop. All item mutation
//! goes through compare-and-transition, so two workers racing on the same
//! item resolve through `Conflict`, never through shared memory.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use labelsquor_workflow::{
    FailureClass, OrchestratorConfig, OrchestratorError, PipelineStage, Result, RetryDecision,
    StageOutcome, WorkItemState,
};

use crate::executor::StageExecutor;
use crate::lock::{LockLease, LockManager};
use crate::models::WorkItem;
use crate::scheduler::{Claim, Scheduler};
use crate::shutdown::Shutdown;
use crate::store::{SqliteWorkflowStore, TransitionRequest};

pub struct Worker {
    id: String,
    store: Arc<SqliteWorkflowStore>,
    scheduler: Scheduler,
    executor: Arc<StageExecutor>,
    config: Arc<OrchestratorConfig>,
    heartbeat: std::time::Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<SqliteWorkflowStore>,
        executor: Arc<StageExecutor>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let lease = Duration::from_std(config.lock_lease).unwrap_or_else(|_| Duration::seconds(300));
        let lock = LockManager::new(Arc::clone(&store), lease);
        let heartbeat = lock.heartbeat_interval();
        let scheduler = Scheduler::new(Arc::clone(&store), lock);
        Self {
            id: id.into(),
            store,
            scheduler,
            executor,
            config,
            heartbeat,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Worker loop until shutdown: claim, process, release; idle with a
    /// doubling backoff while no work is available.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!(worker = %self.id, "worker started");
        let mut idle = self.config.idle_backoff_min;
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.run_iteration().await {
                Ok(true) => {
                    idle = self.config.idle_backoff_min;
                }
                Ok(false) => {
                    if shutdown.sleep(idle).await {
                        break;
                    }
                    idle = (idle * 2).min(self.config.idle_backoff_max);
                }
                Err(e) => {
                    // Store trouble: back off without touching item state.
                    warn!(worker = %self.id, error = %e, "worker iteration failed; backing off");
                    if shutdown.sleep(idle).await {
                        break;
                    }
                    idle = (idle * 2).min(self.config.idle_backoff_max);
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Claim and process at most one item. Returns whether work was done.
    pub async fn run_iteration(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(claim) = self.scheduler.dispatch_one(&self.id, now)? else {
            return Ok(false);
        };
        match self.process_claim(&claim).await {
            Ok(()) => {
                if let Err(e) = claim.lease.release(Utc::now()) {
                    warn!(worker = %self.id, error = %e, "lock release failed");
                }
                Ok(true)
            }
            // Store trouble mid-claim: keep the lease so the item stays
            // RUNNING-and-locked and is reclaimed exactly like a worker
            // crash once the lease lapses.
            Err(e) => Err(e),
        }
    }

    async fn process_claim(&self, claim: &Claim) -> Result<()> {
        let item = claim.lease.item().clone();
        if claim.reclaim {
            return self.reclaim_abandoned(&item);
        }
        if item.state != WorkItemState::Ready {
            // The dispatch snapshot went stale before we locked it.
            return Ok(());
        }
        if item.cancel_requested {
            return self.ignore_conflict(
                TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Ready,
                    WorkItemState::Cancelled,
                    "cancel_requested",
                    &self.id,
                )
                .clear_cancel_requested(),
            );
        }

        let running = match self.store.compare_and_transition(
            &TransitionRequest::new(
                &item.id,
                item.version,
                WorkItemState::Ready,
                WorkItemState::Running,
                "claimed",
                &self.id,
            ),
            Utc::now(),
        ) {
            Ok(item) => item,
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e),
        };

        let outcome = self.run_stage(&claim.lease, &running).await?;

        // Stage boundary: a cancellation request observed here wins over the
        // stage outcome; completed-stage output is still preserved.
        let fresh = self
            .store
            .get_work_item(&running.id)?
            .ok_or_else(|| OrchestratorError::NotFound(running.id.clone()))?;
        if fresh.cancel_requested {
            let mut req = TransitionRequest::new(
                &fresh.id,
                fresh.version,
                WorkItemState::Running,
                WorkItemState::Cancelled,
                "cancel_requested",
                &self.id,
            )
            .clear_cancel_requested();
            if let StageOutcome::Done { summary } = &outcome {
                req = req.with_partial_result(fresh.stage, summary.clone());
            }
            return self.ignore_conflict(req);
        }

        self.apply_outcome(&fresh, outcome)
    }

    /// Run the current stage while extending the lock lease on a heartbeat.
    async fn run_stage(&self, lease: &LockLease, item: &WorkItem) -> Result<StageOutcome> {
        let fut = self.executor.execute(item);
        tokio::pin!(fut);
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                outcome = &mut fut => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = lease.extend(Utc::now()) {
                        // Lease lost to reclamation; the stage keeps running
                        // but every following transition will conflict.
                        warn!(worker = %self.id, work_item = %item.id, error = %e, "lease extension failed");
                    }
                }
            }
        }
    }

    fn apply_outcome(&self, item: &WorkItem, outcome: StageOutcome) -> Result<()> {
        let now = Utc::now();
        match outcome {
            StageOutcome::Done { summary } => {
                let stage = item.stage;
                if stage.is_last() {
                    debug!(worker = %self.id, work_item = %item.id, "pipeline completed");
                    self.ignore_conflict(
                        TransitionRequest::new(
                            &item.id,
                            item.version,
                            WorkItemState::Running,
                            WorkItemState::Completed,
                            "pipeline_completed",
                            &self.id,
                        )
                        .with_partial_result(stage, summary)
                        .clear_next_attempt_at()
                        .clear_last_error(),
                    )
                } else {
                    let next = stage.next().unwrap_or(stage);
                    self.ignore_conflict(
                        TransitionRequest::new(
                            &item.id,
                            item.version,
                            WorkItemState::Running,
                            WorkItemState::Ready,
                            "stage_completed",
                            &self.id,
                        )
                        .with_metadata(json!({ "stage": stage.as_str() }))
                        .with_stage(next)
                        .with_partial_result(stage, summary)
                        .clear_next_attempt_at()
                        .clear_last_error(),
                    )
                }
            }
            StageOutcome::Partial { summary } => self.ignore_conflict(
                TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Running,
                    WorkItemState::Waiting,
                    "stage_yielded",
                    &self.id,
                )
                .with_partial_entry(partial_key(item.stage), summary),
            ),
            StageOutcome::QuotaExceeded {
                service,
                reset_at,
                partial,
            } => {
                let next_attempt = reset_at + resume_jitter();
                let mut req = TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Running,
                    WorkItemState::QuotaExceeded,
                    "quota_exceeded",
                    &self.id,
                )
                .with_metadata(json!({
                    "service": service,
                    "reset_at": reset_at.to_rfc3339(),
                    "progress_percentage": item.progress_percentage(),
                }))
                .set_next_attempt_at(next_attempt)
                .set_quota_service(&service)
                .increment_quota_exceeded()
                .set_last_error(
                    FailureClass::RateLimit,
                    format!("quota exceeded for {}", service),
                );
                if let Some(partial) = partial {
                    req = req.with_partial_entry(partial_key(item.stage), partial);
                }
                self.ignore_conflict(req)
            }
            StageOutcome::Failed { failure } => {
                let failed = match self.store.compare_and_transition(
                    &TransitionRequest::new(
                        &item.id,
                        item.version,
                        WorkItemState::Running,
                        WorkItemState::Failed,
                        &failure.reason,
                        &self.id,
                    )
                    .set_last_error(failure.class, &failure.reason),
                    now,
                ) {
                    Ok(item) => item,
                    Err(e) if e.is_conflict() => return Ok(()),
                    Err(e) => return Err(e),
                };
                self.settle_failure(&failed, failure.class, failure.retry_at)
            }
        }
    }

    /// A RUNNING item whose lease lapsed: its owner died mid-stage. Fail it
    /// with `lock_expired` and put it through the normal retry flow.
    fn reclaim_abandoned(&self, item: &WorkItem) -> Result<()> {
        if item.state != WorkItemState::Running {
            return Ok(());
        }
        info!(worker = %self.id, work_item = %item.id, "reclaiming abandoned item");
        let failed = match self.store.compare_and_transition(
            &TransitionRequest::new(
                &item.id,
                item.version,
                WorkItemState::Running,
                WorkItemState::Failed,
                "lock_expired",
                &self.id,
            )
            .set_last_error(FailureClass::Transient, "lock lease expired"),
            Utc::now(),
        ) {
            Ok(item) => item,
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.settle_failure(&failed, FailureClass::Transient, None)
    }

    /// Map a failure class to the follow-up transition out of FAILED.
    fn settle_failure(
        &self,
        item: &WorkItem,
        class: FailureClass,
        retry_at_hint: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        match self.config.retry.decide(class, item.attempt_count) {
            RetryDecision::Backoff(delay) => self.ignore_conflict(
                TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Failed,
                    WorkItemState::RetryScheduled,
                    "retry_scheduled",
                    &self.id,
                )
                .set_next_attempt_at(now + delay)
                .increment_attempt(),
            ),
            RetryDecision::AwaitReset => {
                let at = retry_at_hint.unwrap_or(now + self.config.retry.base);
                self.ignore_conflict(
                    TransitionRequest::new(
                        &item.id,
                        item.version,
                        WorkItemState::Failed,
                        WorkItemState::RetryScheduled,
                        "rate_limited",
                        &self.id,
                    )
                    .set_next_attempt_at(at),
                )
            }
            RetryDecision::Suspend => self.ignore_conflict(TransitionRequest::new(
                &item.id,
                item.version,
                WorkItemState::Failed,
                WorkItemState::Suspended,
                "validation_failure",
                &self.id,
            )),
            RetryDecision::DeadLetter => {
                let chain = json!({
                    "class": class.as_str(),
                    "message": item.last_error.as_ref().map(|e| e.message.clone()),
                    "stage": item.stage.as_str(),
                    "attempt_count": item.attempt_count,
                });
                self.ignore_conflict(
                    TransitionRequest::new(
                        &item.id,
                        item.version,
                        WorkItemState::Failed,
                        WorkItemState::DeadLettered,
                        "retry_budget_exhausted",
                        &self.id,
                    )
                    .with_dead_letter_chain(chain),
                )
            }
        }
    }

    /// Apply a transition we expect to win while holding the lock; a
    /// conflict means another actor legitimately got there first.
    fn ignore_conflict(&self, req: TransitionRequest) -> Result<()> {
        match self.store.compare_and_transition(&req, Utc::now()) {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(worker = %self.id, work_item = %req.work_item_id, "transition lost to concurrent actor");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Jitter added to a quota reset instant so a fleet of paused items does not
/// thunder back at the exact boundary.
fn resume_jitter() -> Duration {
    Duration::milliseconds(rand::thread_rng().gen_range(500..10_000))
}

fn partial_key(stage: PipelineStage) -> String {
    format!("{}_partial", stage.as_str())
}

/// N cooperating workers plus graceful shutdown.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<Shutdown>,
    grace: std::time::Duration,
}

impl WorkerPool {
    pub fn start(
        store: Arc<SqliteWorkflowStore>,
        executor: Arc<StageExecutor>,
        config: Arc<OrchestratorConfig>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let mut handles = Vec::with_capacity(config.num_workers);
        for n in 0..config.num_workers {
            let worker = Worker::new(
                format!("worker-{}-{}", n, &uuid::Uuid::new_v4().to_string()[..8]),
                Arc::clone(&store),
                Arc::clone(&executor),
                Arc::clone(&config),
            );
            handles.push(tokio::spawn(worker.run(Arc::clone(&shutdown))));
        }
        Self {
            handles,
            shutdown,
            grace: config.shutdown_grace,
        }
    }

    /// Trigger shutdown and wait up to the grace period for in-flight stages
    /// to commit. Workers still running after that are aborted; their leases
    /// lapse and another instance reclaims the items.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let handles = self.handles;
        let drain = async move {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("shutdown grace elapsed; abandoning in-flight workers");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::executor::{StageContext, StageHandler, StageRegistry};
    use crate::quota::QuotaManager;
    use labelsquor_workflow::StageFailure;

    struct AlwaysDone;

    #[async_trait]
    impl StageHandler for AlwaysDone {
        async fn execute(
            &self,
            _item: WorkItem,
            ctx: StageContext,
        ) -> std::result::Result<StageOutcome, StageFailure> {
            Ok(StageOutcome::done(json!({ "stage": ctx.stage.as_str() })))
        }
    }

    fn fixture(registry: StageRegistry) -> (Arc<SqliteWorkflowStore>, Worker) {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-worker-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let config = Arc::new(OrchestratorConfig::default());
        let quota = Arc::new(QuotaManager::new(Arc::clone(&store), Arc::clone(&config)));
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            quota,
            registry,
            config.stage_timeout,
        ));
        let worker = Worker::new("w-test", Arc::clone(&store), executor, config);
        (store, worker)
    }

    fn enqueue(store: &SqliteWorkflowStore, id: &str) {
        let now = Utc::now();
        store.insert_work_item(id, &json!({}), 5, now).unwrap();
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

    #[tokio::test]
    async fn drives_an_item_through_all_stages() {
        let (store, worker) = fixture(StageRegistry::new().register_all(Arc::new(AlwaysDone)));
        enqueue(&store, "wi-1");

        // 7 stages, one claim each; an extra iteration confirms idleness.
        for _ in 0..PipelineStage::ORDER.len() {
            assert!(worker.run_iteration().await.unwrap());
        }
        assert!(!worker.run_iteration().await.unwrap());

        let item = store.get_work_item("wi-1").unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Completed);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.completed_stages().len(), 7);
        assert!(item.lock_holder.is_none());
        assert!(item.completed_at.is_some());

        // CREATED->READY, then per stage READY->RUNNING plus the stage exit.
        let history = store.history("wi-1").unwrap();
        assert_eq!(history.len(), 15);
        assert_eq!(history[0].to_state, WorkItemState::Ready);
        assert_eq!(history.last().unwrap().to_state, WorkItemState::Completed);
        let ran: Vec<_> = history
            .iter()
            .filter(|t| t.to_state == WorkItemState::Running)
            .collect();
        assert_eq!(ran.len(), 7);
    }

    #[tokio::test]
    async fn reclaims_item_with_expired_lease() {
        let (store, worker) = fixture(StageRegistry::new().register_all(Arc::new(AlwaysDone)));
        enqueue(&store, "wi-1");
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        // A dead worker claimed it long ago; its lease is far in the past.
        store
            .acquire_lock("wi-1", "w-dead", Duration::seconds(1), t0)
            .unwrap();
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
                t0,
            )
            .unwrap();

        assert!(worker.run_iteration().await.unwrap());
        let item = store.get_work_item("wi-1").unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::RetryScheduled);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_error.as_ref().unwrap().message, "lock lease expired");

        let reasons: Vec<_> = store
            .history("wi-1")
            .unwrap()
            .into_iter()
            .map(|t| t.reason)
            .collect();
        assert!(reasons.contains(&"lock_expired".to_string()));
    }

    #[tokio::test]
    async fn cancel_requested_consumed_before_running() {
        let (store, worker) = fixture(StageRegistry::new().register_all(Arc::new(AlwaysDone)));
        enqueue(&store, "wi-1");
        store.set_cancel_requested("wi-1").unwrap();

        assert!(worker.run_iteration().await.unwrap());
        let item = store.get_work_item("wi-1").unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Cancelled);
        assert!(!item.cancel_requested);
        assert!(item.completed_stages().is_empty());
    }
}
