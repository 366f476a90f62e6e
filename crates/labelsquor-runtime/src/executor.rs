//! Stage execution: a closed registry of handlers, per-stage timeout, and
//! outcome normalization.
//!
//! Handlers are external collaborators and must be idempotent with respect
//! to their stage key: at-least-once delivery means a stage may run more
//! than once. Typed failures flow back as values; panics and timeouts are
//! wrapped as TRANSIENT at this boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use labelsquor_workflow::{PipelineStage, Result, StageFailure, StageOutcome};

use crate::models::{EventType, MetricKind, WorkItem};
use crate::quota::QuotaManager;
use crate::store::SqliteWorkflowStore;

/// Context handed to a stage handler. Carries the quota manager so handlers
/// can pre-check estimated cost and report actual cost, plus the deadline
/// the handler is expected to observe.
#[derive(Clone)]
pub struct StageContext {
    pub work_item_id: String,
    pub stage: PipelineStage,
    pub quota: Arc<QuotaManager>,
    pub deadline: DateTime<Utc>,
}

/// A handler for one pipeline stage.
///
/// Returning `Err(StageFailure)` is equivalent to returning
/// `StageOutcome::Failed` with that failure; both are normalized by the
/// executor.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(
        &self,
        item: WorkItem,
        ctx: StageContext,
    ) -> std::result::Result<StageOutcome, StageFailure>;
}

/// Closed mapping from stage to handler.
#[derive(Clone, Default)]
pub struct StageRegistry {
    handlers: HashMap<PipelineStage, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, stage: PipelineStage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    /// Register one handler for every stage; useful for uniform pipelines
    /// and tests.
    pub fn register_all(mut self, handler: Arc<dyn StageHandler>) -> Self {
        for stage in PipelineStage::ORDER {
            self.handlers.insert(stage, Arc::clone(&handler));
        }
        self
    }

    pub fn handler_for(&self, stage: PipelineStage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }
}

pub struct StageExecutor {
    store: Arc<SqliteWorkflowStore>,
    quota: Arc<QuotaManager>,
    registry: StageRegistry,
    stage_timeout: std::time::Duration,
}

impl StageExecutor {
    pub fn new(
        store: Arc<SqliteWorkflowStore>,
        quota: Arc<QuotaManager>,
        registry: StageRegistry,
        stage_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            quota,
            registry,
            stage_timeout,
        }
    }

    /// Run the item's current stage and return the normalized outcome.
    /// Records the stage lifecycle events and the stage duration metric;
    /// the caller owns the resulting state transition.
    pub async fn execute(&self, item: &WorkItem) -> Result<StageOutcome> {
        let stage = item.stage;
        let started = Instant::now();
        let now = Utc::now();
        self.store.insert_event(
            &item.id,
            EventType::StageStarted,
            &json!({ "stage": stage.as_str(), "attempt": item.attempt_count }),
            now,
        )?;
        debug!(work_item = %item.id, stage = %stage, "stage started");

        let outcome = match self.registry.handler_for(stage) {
            Some(handler) => self.run_handler(handler, item, stage).await,
            None => StageOutcome::failed(StageFailure::fatal(format!(
                "no handler registered for stage {}",
                stage
            ))),
        };

        let elapsed_ms = started.elapsed().as_millis() as f64;
        let finished = Utc::now();
        self.store.record_metric(
            Some(&item.id),
            MetricKind::StageDurationMs,
            stage.as_str(),
            elapsed_ms,
            finished,
        )?;
        match &outcome {
            StageOutcome::Done { summary } => {
                self.store.insert_event(
                    &item.id,
                    EventType::StageCompleted,
                    &json!({
                        "stage": stage.as_str(),
                        "duration_ms": elapsed_ms,
                        "summary": summary,
                    }),
                    finished,
                )?;
            }
            StageOutcome::Partial { .. } => {
                self.store.insert_event(
                    &item.id,
                    EventType::StageCompleted,
                    &json!({
                        "stage": stage.as_str(),
                        "duration_ms": elapsed_ms,
                        "yielded": true,
                    }),
                    finished,
                )?;
            }
            StageOutcome::Failed { failure } => {
                warn!(
                    work_item = %item.id,
                    stage = %stage,
                    class = failure.class.as_str(),
                    reason = %failure.reason,
                    "stage failed"
                );
                self.store.insert_event(
                    &item.id,
                    EventType::StageFailed,
                    &json!({
                        "stage": stage.as_str(),
                        "class": failure.class.as_str(),
                        "reason": failure.reason,
                    }),
                    finished,
                )?;
            }
            StageOutcome::QuotaExceeded { service, reset_at, .. } => {
                warn!(
                    work_item = %item.id,
                    stage = %stage,
                    service = %service,
                    reset_at = %reset_at,
                    "stage hit quota"
                );
                self.store.insert_event(
                    &item.id,
                    EventType::QuotaExceeded,
                    &json!({
                        "stage": stage.as_str(),
                        "service": service,
                        "reset_at": reset_at.to_rfc3339(),
                    }),
                    finished,
                )?;
            }
        }
        Ok(outcome)
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn StageHandler>,
        item: &WorkItem,
        stage: PipelineStage,
    ) -> StageOutcome {
        let ctx = StageContext {
            work_item_id: item.id.clone(),
            stage,
            quota: Arc::clone(&self.quota),
            deadline: Utc::now()
                + chrono::Duration::from_std(self.stage_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        };
        let snapshot = item.clone();
        // Handlers run in their own task so a panic is contained and
        // surfaces as a join error rather than tearing down the worker.
        let task = tokio::spawn(async move { handler.execute(snapshot, ctx).await });
        match tokio::time::timeout(self.stage_timeout, task).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(failure))) => StageOutcome::failed(failure),
            Ok(Err(join_err)) => StageOutcome::failed(StageFailure::transient(format!(
                "stage handler panicked: {}",
                join_err
            ))),
            Err(_) => StageOutcome::failed(StageFailure::transient("timeout")),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::models::QuotaUsage;
    use crate::store::TransitionRequest;
    use labelsquor_workflow::{FailureClass, OrchestratorConfig, WorkItemState};

    struct EchoHandler;

    #[async_trait]
    impl StageHandler for EchoHandler {
        async fn execute(
            &self,
            item: WorkItem,
            ctx: StageContext,
        ) -> std::result::Result<StageOutcome, StageFailure> {
            ctx.quota
                .record(
                    "vision",
                    &QuotaUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                        image_count: 0,
                    },
                    Some(&item.id),
                    Utc::now(),
                )
                .map_err(|e| StageFailure::transient(e.to_string()))?;
            Ok(StageOutcome::done(json!({ "stage": ctx.stage.as_str() })))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl StageHandler for SlowHandler {
        async fn execute(
            &self,
            _item: WorkItem,
            _ctx: StageContext,
        ) -> std::result::Result<StageOutcome, StageFailure> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(StageOutcome::done(json!({})))
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl StageHandler for PanickyHandler {
        async fn execute(
            &self,
            _item: WorkItem,
            _ctx: StageContext,
        ) -> std::result::Result<StageOutcome, StageFailure> {
            panic!("handler exploded");
        }
    }

    fn fixture(registry: StageRegistry) -> (StageExecutor, Arc<SqliteWorkflowStore>, WorkItem) {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-exec-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let quota = Arc::new(QuotaManager::new(
            Arc::clone(&store),
            Arc::new(OrchestratorConfig::default()),
        ));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        store.insert_work_item("wi-1", &json!({}), 0, now).unwrap();
        let item = store
            .compare_and_transition(
                &TransitionRequest::new(
                    "wi-1",
                    0,
                    WorkItemState::Created,
                    WorkItemState::Ready,
                    "enqueued",
                    "ingress",
                ),
                now,
            )
            .unwrap();
        let executor = StageExecutor::new(
            Arc::clone(&store),
            quota,
            registry,
            std::time::Duration::from_millis(200),
        );
        (executor, store, item)
    }

    #[tokio::test]
    async fn successful_stage_emits_lifecycle_events() {
        let registry = StageRegistry::new().register_all(Arc::new(EchoHandler));
        let (executor, store, item) = fixture(registry);
        let outcome = executor.execute(&item).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Done { .. }));

        let types: Vec<_> = store
            .undelivered_events(50)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&EventType::StageStarted));
        assert!(types.contains(&EventType::StageCompleted));
    }

    #[tokio::test]
    async fn timeout_becomes_transient_failure() {
        let registry = StageRegistry::new().register_all(Arc::new(SlowHandler));
        let (executor, store, item) = fixture(registry);
        let outcome = executor.execute(&item).await.unwrap();
        let StageOutcome::Failed { failure } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.class, FailureClass::Transient);
        assert_eq!(failure.reason, "timeout");
        let types: Vec<_> = store
            .undelivered_events(50)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&EventType::StageFailed));
    }

    #[tokio::test]
    async fn panic_is_contained_as_transient() {
        let registry = StageRegistry::new().register_all(Arc::new(PanickyHandler));
        let (executor, _store, item) = fixture(registry);
        let outcome = executor.execute(&item).await.unwrap();
        let StageOutcome::Failed { failure } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.class, FailureClass::Transient);
        assert!(failure.reason.contains("panicked"));
    }

    #[tokio::test]
    async fn missing_handler_is_fatal() {
        let (executor, _store, item) = fixture(StageRegistry::new());
        let outcome = executor.execute(&item).await.unwrap();
        let StageOutcome::Failed { failure } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.class, FailureClass::Fatal);
    }
}
