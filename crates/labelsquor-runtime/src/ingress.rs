//! Embedding surface for producers and operators: enqueue, cancel, retry,
//! suspend, wake, and the read-only views. No HTTP here; the transport
//! layer lives with the API service.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use labelsquor_workflow::{OrchestratorError, Result, WorkItemState};

use crate::models::{DeadLetterRow, ListFilter, TransitionRecord, WorkItem};
use crate::store::{SqliteWorkflowStore, TransitionRequest};

const ACTOR: &str = "ingress";

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<SqliteWorkflowStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<SqliteWorkflowStore>) -> Self {
        Self { store }
    }

    /// Insert a work item and make it immediately schedulable. The payload
    /// is opaque to the orchestrator; stage handlers interpret it.
    pub fn enqueue(
        &self,
        payload: Value,
        priority: i64,
        metadata: Option<Value>,
    ) -> Result<WorkItem> {
        let id = format!("wi-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        self.store.insert_work_item(&id, &payload, priority, now)?;
        let mut req = TransitionRequest::new(
            &id,
            0,
            WorkItemState::Created,
            WorkItemState::Ready,
            "enqueued",
            ACTOR,
        );
        if let Some(metadata) = metadata {
            req = req.with_metadata(metadata);
        }
        let item = self.store.compare_and_transition(&req, now)?;
        info!(work_item = %id, priority, "work item enqueued");
        Ok(item)
    }

    /// Cancel an item. Directly cancellable states transition now; a
    /// RUNNING item gets a cancellation request honored at its next stage
    /// boundary. Terminal states are rejected as illegal.
    pub fn cancel(&self, work_item_id: &str, reason: &str) -> Result<WorkItem> {
        let item = self.require(work_item_id)?;
        if item.state == WorkItemState::Running {
            let item = self.store.set_cancel_requested(work_item_id)?;
            info!(work_item = %work_item_id, reason, "cancellation requested");
            return Ok(item);
        }
        if !item.state.is_directly_cancellable() {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkItemState::Cancelled,
            });
        }
        let cancelled = self.store.compare_and_transition(
            &TransitionRequest::new(
                work_item_id,
                item.version,
                item.state,
                WorkItemState::Cancelled,
                reason,
                ACTOR,
            ),
            Utc::now(),
        )?;
        info!(work_item = %work_item_id, reason, "work item cancelled");
        Ok(cancelled)
    }

    /// Operator retry: FAILED or SUSPENDED back to READY. Repeated calls are
    /// idempotent: once the item is READY, further retries are no-ops.
    pub fn retry(&self, work_item_id: &str) -> Result<WorkItem> {
        let item = self.require(work_item_id)?;
        if item.state == WorkItemState::Ready {
            return Ok(item);
        }
        if !matches!(
            item.state,
            WorkItemState::Failed | WorkItemState::Suspended
        ) {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkItemState::Ready,
            });
        }
        self.store.compare_and_transition(
            &TransitionRequest::new(
                work_item_id,
                item.version,
                item.state,
                WorkItemState::Ready,
                "manual_retry",
                ACTOR,
            )
            .clear_next_attempt_at(),
            Utc::now(),
        )
    }

    /// Park a FAILED item for manual inspection.
    pub fn suspend(&self, work_item_id: &str, reason: &str) -> Result<WorkItem> {
        let item = self.require(work_item_id)?;
        if item.state != WorkItemState::Failed {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkItemState::Suspended,
            });
        }
        self.store.compare_and_transition(
            &TransitionRequest::new(
                work_item_id,
                item.version,
                WorkItemState::Failed,
                WorkItemState::Suspended,
                reason,
                ACTOR,
            ),
            Utc::now(),
        )
    }

    /// External wake for an item parked in WAITING by a yielding stage.
    pub fn wake(&self, work_item_id: &str) -> Result<WorkItem> {
        let item = self.require(work_item_id)?;
        if item.state != WorkItemState::Waiting {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkItemState::Ready,
            });
        }
        self.store.compare_and_transition(
            &TransitionRequest::new(
                work_item_id,
                item.version,
                WorkItemState::Waiting,
                WorkItemState::Ready,
                "external_wake",
                ACTOR,
            ),
            Utc::now(),
        )
    }

    pub fn get(&self, work_item_id: &str) -> Result<WorkItem> {
        self.require(work_item_id)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        self.store.list_items(filter, Utc::now())
    }

    /// Ordered transition history; the full audit trail for one item.
    pub fn history(&self, work_item_id: &str) -> Result<Vec<TransitionRecord>> {
        self.require(work_item_id)?;
        self.store.history(work_item_id)
    }

    /// Dead-lettered items stay queryable indefinitely with their error
    /// chain; there is no replay path out of a terminal state.
    pub fn dead_letter(&self, work_item_id: &str) -> Result<Option<DeadLetterRow>> {
        self.store.dead_letter_for(work_item_id)
    }

    fn require(&self, work_item_id: &str) -> Result<WorkItem> {
        self.store
            .get_work_item(work_item_id)?
            .ok_or_else(|| OrchestratorError::NotFound(work_item_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fixture() -> (Arc<SqliteWorkflowStore>, Orchestrator) {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-ingress-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let orchestrator = Orchestrator::new(Arc::clone(&store));
        (store, orchestrator)
    }

    #[test]
    fn enqueue_lands_in_ready_with_one_transition() {
        let (store, orchestrator) = fixture();
        let item = orchestrator
            .enqueue(json!({"product_version": "pv-9"}), 5, None)
            .unwrap();
        assert_eq!(item.state, WorkItemState::Ready);
        assert_eq!(item.priority, 5);
        let history = store.history(&item.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_state, WorkItemState::Created);
    }

    #[test]
    fn cancel_before_any_worker_is_terminal_with_no_stage_run() {
        let (store, orchestrator) = fixture();
        let item = orchestrator.enqueue(json!({}), 0, None).unwrap();
        let cancelled = orchestrator.cancel(&item.id, "operator request").unwrap();
        assert_eq!(cancelled.state, WorkItemState::Cancelled);
        assert!(cancelled.completed_stages().is_empty());

        // Terminal: a second cancel is illegal.
        let err = orchestrator.cancel(&item.id, "again").unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
        assert_eq!(store.history(&item.id).unwrap().len(), 2);
    }

    #[test]
    fn cancel_running_only_records_request() {
        let (store, orchestrator) = fixture();
        let item = orchestrator.enqueue(json!({}), 0, None).unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Ready,
                    WorkItemState::Running,
                    "claimed",
                    "w1",
                ),
                Utc::now(),
            )
            .unwrap();
        let requested = orchestrator.cancel(&item.id, "operator").unwrap();
        assert_eq!(requested.state, WorkItemState::Running);
        assert!(requested.cancel_requested);
    }

    #[test]
    fn retry_is_legal_from_failed_and_suspended_only() {
        let (store, orchestrator) = fixture();
        let item = orchestrator.enqueue(json!({}), 0, None).unwrap();
        assert!(matches!(
            orchestrator.retry(&item.id),
            Err(OrchestratorError::IllegalTransition { .. })
        ));

        store
            .compare_and_transition(
                &TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkItemState::Ready,
                    WorkItemState::Running,
                    "claimed",
                    "w1",
                ),
                Utc::now(),
            )
            .unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    &item.id,
                    item.version + 1,
                    WorkItemState::Running,
                    WorkItemState::Failed,
                    "boom",
                    "w1",
                ),
                Utc::now(),
            )
            .unwrap();

        let suspended = orchestrator.suspend(&item.id, "needs inspection").unwrap();
        assert_eq!(suspended.state, WorkItemState::Suspended);
        let retried = orchestrator.retry(&item.id).unwrap();
        assert_eq!(retried.state, WorkItemState::Ready);

        // Repeated retry is a no-op once the item is schedulable again.
        let again = orchestrator.retry(&item.id).unwrap();
        assert_eq!(again.state, WorkItemState::Ready);
        assert_eq!(again.version, retried.version);
    }

    #[test]
    fn unknown_items_are_not_found() {
        let (_, orchestrator) = fixture();
        assert!(matches!(
            orchestrator.get("ghost"),
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.cancel("ghost", "x"),
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
