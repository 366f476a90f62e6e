//! Resume sweeper: periodically returns parked items to READY.
//!
//! Two jobs per tick: RETRY_SCHEDULED items whose retry instant has passed,
//! and QUOTA_EXCEEDED items whose service has capacity again. Both go
//! through compare-and-transition; losing a race just means another sweeper
//! or operator got there first, and the item is skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use labelsquor_workflow::{Result, WorkItemState};

use crate::models::EventType;
use crate::quota::QuotaManager;
use crate::shutdown::Shutdown;
use crate::store::{SqliteWorkflowStore, TransitionRequest};

const SWEEP_BATCH: usize = 64;
/// Token estimate used when probing whether a paused service can resume;
/// matches the enrichment-stage estimate.
const RESUME_TOKEN_ESTIMATE: u64 = 1_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub retries_resumed: usize,
    pub quota_resumed: usize,
}

pub struct ResumeSweeper {
    store: Arc<SqliteWorkflowStore>,
    quota: Arc<QuotaManager>,
    interval: std::time::Duration,
}

impl ResumeSweeper {
    pub fn new(
        store: Arc<SqliteWorkflowStore>,
        quota: Arc<QuotaManager>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            quota,
            interval,
        }
    }

    /// One sweep pass at `now`.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        for (id, version) in self.store.due_retry_scheduled(now, SWEEP_BATCH)? {
            let req = TransitionRequest::new(
                &id,
                version,
                WorkItemState::RetryScheduled,
                WorkItemState::Ready,
                "retry_ready",
                "sweeper",
            )
            .clear_next_attempt_at()
            .with_event(EventType::Resumed, json!({ "reason": "retry_ready" }));
            match self.store.compare_and_transition(&req, now) {
                Ok(_) => {
                    debug!(work_item = %id, "retry requeued");
                    stats.retries_resumed += 1;
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        for (id, version, service) in self.store.due_quota_paused(now, SWEEP_BATCH)? {
            if let Some(service) = service.as_deref() {
                if !self.quota.has_capacity(service, RESUME_TOKEN_ESTIMATE, now)? {
                    // Still exhausted; the next tick re-checks.
                    continue;
                }
            }
            let req = TransitionRequest::new(
                &id,
                version,
                WorkItemState::QuotaExceeded,
                WorkItemState::Ready,
                "quota_reset",
                "sweeper",
            )
            .clear_next_attempt_at()
            .clear_quota_service()
            .with_event(
                EventType::Resumed,
                json!({ "reason": "quota_reset", "service": service }),
            );
            match self.store.compare_and_transition(&req, now) {
                Ok(_) => {
                    debug!(work_item = %id, service = service.as_deref(), "quota-paused item requeued");
                    stats.quota_resumed += 1;
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(stats)
    }

    pub async fn run(&self, shutdown: Arc<Shutdown>) {
        info!(interval_s = self.interval.as_secs(), "resume sweeper started");
        loop {
            if shutdown.sleep(self.interval).await {
                break;
            }
            match self.sweep_once(Utc::now()) {
                Ok(stats) if stats.retries_resumed + stats.quota_resumed > 0 => {
                    info!(
                        retries = stats.retries_resumed,
                        quota = stats.quota_resumed,
                        "sweeper requeued items"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "sweep failed"),
            }
        }
        info!("resume sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use labelsquor_workflow::{FailureClass, OrchestratorConfig, QuotaLimits};

    use crate::models::QuotaUsage;

    fn fixture(limits: Option<QuotaLimits>) -> (Arc<SqliteWorkflowStore>, ResumeSweeper, Arc<QuotaManager>) {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-sweeper-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let mut config = OrchestratorConfig::default();
        if let Some(limits) = limits {
            config = config.with_quota_limits("vision", limits);
        }
        let quota = Arc::new(QuotaManager::new(Arc::clone(&store), Arc::new(config)));
        let sweeper = ResumeSweeper::new(
            Arc::clone(&store),
            Arc::clone(&quota),
            std::time::Duration::from_secs(15),
        );
        (store, sweeper, quota)
    }

    fn park_in(
        store: &SqliteWorkflowStore,
        id: &str,
        target: WorkItemState,
        next_attempt: DateTime<Utc>,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) {
        store.insert_work_item(id, &json!({}), 0, now).unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(id, 0, WorkItemState::Created, WorkItemState::Ready, "enqueued", "ingress"),
                now,
            )
            .unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(id, 1, WorkItemState::Ready, WorkItemState::Running, "claimed", "w1"),
                now,
            )
            .unwrap();
        match target {
            WorkItemState::RetryScheduled => {
                store
                    .compare_and_transition(
                        &TransitionRequest::new(id, 2, WorkItemState::Running, WorkItemState::Failed, "boom", "w1")
                            .set_last_error(FailureClass::Transient, "boom"),
                        now,
                    )
                    .unwrap();
                store
                    .compare_and_transition(
                        &TransitionRequest::new(
                            id,
                            3,
                            WorkItemState::Failed,
                            WorkItemState::RetryScheduled,
                            "backoff",
                            "w1",
                        )
                        .set_next_attempt_at(next_attempt)
                        .increment_attempt(),
                        now,
                    )
                    .unwrap();
            }
            WorkItemState::QuotaExceeded => {
                let mut req = TransitionRequest::new(
                    id,
                    2,
                    WorkItemState::Running,
                    WorkItemState::QuotaExceeded,
                    "quota exhausted",
                    "w1",
                )
                .set_next_attempt_at(next_attempt)
                .increment_quota_exceeded();
                if let Some(service) = service {
                    req = req.set_quota_service(service);
                }
                store.compare_and_transition(&req, now).unwrap();
            }
            other => panic!("unsupported park state {other}"),
        }
    }

    #[test]
    fn due_retries_return_to_ready() {
        let (store, sweeper, _) = fixture(None);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        park_in(&store, "due", WorkItemState::RetryScheduled, now + Duration::seconds(10), None, now);
        park_in(&store, "later", WorkItemState::RetryScheduled, now + Duration::hours(1), None, now);

        let stats = sweeper.sweep_once(now + Duration::seconds(30)).unwrap();
        assert_eq!(stats.retries_resumed, 1);
        assert_eq!(
            store.get_work_item("due").unwrap().unwrap().state,
            WorkItemState::Ready
        );
        assert_eq!(
            store.get_work_item("later").unwrap().unwrap().state,
            WorkItemState::RetryScheduled
        );
    }

    #[test]
    fn quota_paused_item_waits_for_capacity() {
        let (store, sweeper, quota) = fixture(Some(QuotaLimits {
            requests_per_minute: 1,
            ..QuotaLimits::default()
        }));
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 20).unwrap();
        // Exhaust the minute window, then park an item due immediately.
        quota
            .record("vision", &QuotaUsage::default(), None, t0)
            .unwrap();
        park_in(
            &store,
            "paused",
            WorkItemState::QuotaExceeded,
            t0 + Duration::seconds(5),
            Some("vision"),
            t0,
        );

        // Due, but the window is still exhausted: stays parked.
        let stats = sweeper.sweep_once(t0 + Duration::seconds(10)).unwrap();
        assert_eq!(stats.quota_resumed, 0);
        assert_eq!(
            store.get_work_item("paused").unwrap().unwrap().state,
            WorkItemState::QuotaExceeded
        );

        // One tick after the minute boundary, capacity is back.
        let after_reset = Utc.with_ymd_and_hms(2025, 6, 1, 9, 1, 1).unwrap();
        let stats = sweeper.sweep_once(after_reset).unwrap();
        assert_eq!(stats.quota_resumed, 1);
        let item = store.get_work_item("paused").unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Ready);
        assert!(item.next_attempt_at.is_none());
        assert!(item.quota_service.is_none());
    }

    #[test]
    fn cancelled_items_are_not_resurrected() {
        let (store, sweeper, _) = fixture(None);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        park_in(&store, "due", WorkItemState::RetryScheduled, now, None, now);
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    "due",
                    4,
                    WorkItemState::RetryScheduled,
                    WorkItemState::Cancelled,
                    "operator",
                    "ingress",
                ),
                now,
            )
            .unwrap();
        let stats = sweeper.sweep_once(now + Duration::seconds(1)).unwrap();
        assert_eq!(stats.retries_resumed, 0);
        assert_eq!(
            store.get_work_item("due").unwrap().unwrap().state,
            WorkItemState::Cancelled
        );
    }
}
