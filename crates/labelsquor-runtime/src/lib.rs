//! Durable, concurrent workflow runtime for the LabelSquor enrichment
//! pipeline.
//!
//! Work items move through a strict state machine persisted in SQLite; N
//! cooperating workers claim items under lease-based locks, run the current
//! pipeline stage through a handler registry, and commit every state change
//! through a single compare-and-transition primitive that co-writes the
//! audit trail, the event outbox, and metrics. Quota exhaustion parks items
//! with their progress preserved; a sweeper returns them once the window
//! resets.

pub mod events;
pub mod executor;
pub mod ingress;
pub mod lock;
pub mod models;
pub mod observability;
pub mod quota;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use events::{DeliveryStats, EventBus, EventSubscriber, SubscriberError};
pub use executor::{StageContext, StageExecutor, StageHandler, StageRegistry};
pub use ingress::Orchestrator;
pub use lock::{LockLease, LockManager};
pub use models::{
    DeadLetterRow, DispatchCandidate, EventRecord, EventType, LastError, ListFilter, MetricKind,
    QuotaCounter, QuotaUsage, QuotaUsageLogRow, QuotaWindow, TransitionRecord, WorkItem,
};
pub use observability::{DurationSummary, MetricsReport, ObservabilityView};
pub use quota::{QuotaDecision, QuotaManager, QuotaStatus, QuotaWindowStatus};
pub use runtime::WorkflowRuntime;
pub use scheduler::{Claim, Scheduler};
pub use shutdown::Shutdown;
pub use store::{SqliteWorkflowStore, TransitionRequest, TransitionUpdates};
pub use sweeper::{ResumeSweeper, SweepStats};
pub use worker::{Worker, WorkerPool};

pub use labelsquor_workflow::{
    FailureClass, OrchestratorConfig, OrchestratorError, PipelineStage, QuotaLimits, Result,
    RetryDecision, RetryPolicy, StageFailure, StageOutcome, UsagePricing, WorkItemState,
};
