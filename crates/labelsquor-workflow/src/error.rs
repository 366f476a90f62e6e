//! Error taxonomy shared by the orchestrator crates.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state::WorkItemState;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: WorkItemState,
        to: WorkItemState,
    },

    /// Optimistic-concurrency loss: another actor moved the item first.
    #[error("version conflict for work item: {0}")]
    Conflict(String),

    #[error("quota exceeded for {service}; resets at {reset_at}")]
    QuotaExceeded {
        service: String,
        reset_at: DateTime<Utc>,
    },

    #[error("store error: {0}")]
    Store(String),

    /// The store could not be reached at all; callers back off and retry
    /// without touching item state.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Conflicts are expected under contention and handled by looping, not
    /// by surfacing to callers.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
