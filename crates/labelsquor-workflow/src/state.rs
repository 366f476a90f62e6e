//! Workflow states, pipeline stages, and the legal-transition table.
//!
//! Pure logic, no I/O. The durable store is the only component that applies
//! transitions; everything else asks this module whether a transition is
//! legal before attempting it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a work item in the orchestrator state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Created,
    Ready,
    Running,
    Waiting,
    Completed,
    Failed,
    RetryScheduled,
    QuotaExceeded,
    Suspended,
    Cancelled,
    DeadLettered,
}

/// Ordered pipeline stages executed while a work item is RUNNING.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Discovery,
    ImageFetch,
    Enrichment,
    DataMapping,
    Scoring,
    Indexing,
    Notification,
}

/// Legal state transitions. `RUNNING -> CANCELLED` is included but only a
/// worker observing a pending cancellation request at a stage boundary may
/// issue it; the ingress surface records the request instead.
const TRANSITIONS: &[(WorkItemState, WorkItemState)] = &[
    (WorkItemState::Created, WorkItemState::Ready),
    (WorkItemState::Created, WorkItemState::Cancelled),
    (WorkItemState::Ready, WorkItemState::Running),
    (WorkItemState::Ready, WorkItemState::Cancelled),
    (WorkItemState::Running, WorkItemState::Ready),
    (WorkItemState::Running, WorkItemState::Completed),
    (WorkItemState::Running, WorkItemState::Waiting),
    (WorkItemState::Running, WorkItemState::Failed),
    (WorkItemState::Running, WorkItemState::QuotaExceeded),
    (WorkItemState::Running, WorkItemState::Cancelled),
    (WorkItemState::Waiting, WorkItemState::Ready),
    (WorkItemState::Waiting, WorkItemState::Cancelled),
    (WorkItemState::Failed, WorkItemState::Ready),
    (WorkItemState::Failed, WorkItemState::RetryScheduled),
    (WorkItemState::Failed, WorkItemState::Suspended),
    (WorkItemState::Failed, WorkItemState::DeadLettered),
    (WorkItemState::RetryScheduled, WorkItemState::Ready),
    (WorkItemState::RetryScheduled, WorkItemState::Cancelled),
    (WorkItemState::QuotaExceeded, WorkItemState::Ready),
    (WorkItemState::QuotaExceeded, WorkItemState::Cancelled),
    (WorkItemState::Suspended, WorkItemState::Ready),
    (WorkItemState::Suspended, WorkItemState::Cancelled),
];

impl WorkItemState {
    /// Whether `self -> to` appears in the legal-transition table.
    pub fn can_transition_to(self, to: WorkItemState) -> bool {
        TRANSITIONS.iter().any(|&(f, t)| f == self && t == to)
    }

    /// Terminal states are sinks: no outbound transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemState::Completed | WorkItemState::Cancelled | WorkItemState::DeadLettered
        )
    }

    /// States from which the ingress surface may cancel directly. A RUNNING
    /// item is cancelled cooperatively via the request flag instead.
    pub fn is_directly_cancellable(self) -> bool {
        !self.is_terminal() && self != WorkItemState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemState::Created => "created",
            WorkItemState::Ready => "ready",
            WorkItemState::Running => "running",
            WorkItemState::Waiting => "waiting",
            WorkItemState::Completed => "completed",
            WorkItemState::Failed => "failed",
            WorkItemState::RetryScheduled => "retry_scheduled",
            WorkItemState::QuotaExceeded => "quota_exceeded",
            WorkItemState::Suspended => "suspended",
            WorkItemState::Cancelled => "cancelled",
            WorkItemState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(WorkItemState::Created),
            "ready" => Some(WorkItemState::Ready),
            "running" => Some(WorkItemState::Running),
            "waiting" => Some(WorkItemState::Waiting),
            "completed" => Some(WorkItemState::Completed),
            "failed" => Some(WorkItemState::Failed),
            "retry_scheduled" => Some(WorkItemState::RetryScheduled),
            "quota_exceeded" => Some(WorkItemState::QuotaExceeded),
            "suspended" => Some(WorkItemState::Suspended),
            "cancelled" => Some(WorkItemState::Cancelled),
            "dead_lettered" => Some(WorkItemState::DeadLettered),
            _ => None,
        }
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineStage {
    /// Pipeline order; a work item walks this front to back.
    pub const ORDER: [PipelineStage; 7] = [
        PipelineStage::Discovery,
        PipelineStage::ImageFetch,
        PipelineStage::Enrichment,
        PipelineStage::DataMapping,
        PipelineStage::Scoring,
        PipelineStage::Indexing,
        PipelineStage::Notification,
    ];

    pub fn first() -> Self {
        PipelineStage::Discovery
    }

    /// Next stage in pipeline order, or `None` after NOTIFICATION.
    pub fn next(self) -> Option<Self> {
        let idx = self.index();
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn index(self) -> usize {
        Self::ORDER.iter().position(|&s| s == self).unwrap_or(0)
    }

    pub fn is_last(self) -> bool {
        self == PipelineStage::Notification
    }

    /// Percentage of the pipeline completed once `completed` stages are done.
    pub fn progress_percentage(completed: usize) -> u8 {
        let total = Self::ORDER.len();
        ((completed.min(total) as f64 / total as f64) * 100.0) as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Discovery => "discovery",
            PipelineStage::ImageFetch => "image_fetch",
            PipelineStage::Enrichment => "enrichment",
            PipelineStage::DataMapping => "data_mapping",
            PipelineStage::Scoring => "scoring",
            PipelineStage::Indexing => "indexing",
            PipelineStage::Notification => "notification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ORDER.iter().copied().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outbound_transitions() {
        for &(from, _) in TRANSITIONS {
            assert!(!from.is_terminal(), "{} is terminal but has an edge", from);
        }
    }

    #[test]
    fn running_reaches_every_stage_outcome_state() {
        let running = WorkItemState::Running;
        for to in [
            WorkItemState::Ready,
            WorkItemState::Completed,
            WorkItemState::Waiting,
            WorkItemState::Failed,
            WorkItemState::QuotaExceeded,
            WorkItemState::Cancelled,
        ] {
            assert!(running.can_transition_to(to), "running -> {} missing", to);
        }
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!WorkItemState::Ready.can_transition_to(WorkItemState::Completed));
        assert!(!WorkItemState::Completed.can_transition_to(WorkItemState::Ready));
        assert!(!WorkItemState::DeadLettered.can_transition_to(WorkItemState::Ready));
        assert!(!WorkItemState::QuotaExceeded.can_transition_to(WorkItemState::Running));
    }

    #[test]
    fn cancellable_from_every_non_running_non_terminal_state() {
        for from in [
            WorkItemState::Created,
            WorkItemState::Ready,
            WorkItemState::Waiting,
            WorkItemState::RetryScheduled,
            WorkItemState::QuotaExceeded,
            WorkItemState::Suspended,
        ] {
            assert!(from.is_directly_cancellable());
            assert!(from.can_transition_to(WorkItemState::Cancelled));
        }
        assert!(!WorkItemState::Running.is_directly_cancellable());
        assert!(!WorkItemState::Completed.is_directly_cancellable());
    }

    #[test]
    fn stage_order_walks_to_notification() {
        let mut stage = PipelineStage::first();
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            visited.push(next);
            stage = next;
        }
        assert_eq!(visited, PipelineStage::ORDER);
        assert!(stage.is_last());
    }

    #[test]
    fn state_strings_round_trip() {
        for &(from, to) in TRANSITIONS {
            assert_eq!(WorkItemState::parse(from.as_str()), Some(from));
            assert_eq!(WorkItemState::parse(to.as_str()), Some(to));
        }
        assert_eq!(WorkItemState::parse("unknown"), None);
    }

    #[test]
    fn progress_percentage_spans_pipeline() {
        assert_eq!(PipelineStage::progress_percentage(0), 0);
        assert_eq!(PipelineStage::progress_percentage(2), 28);
        assert_eq!(PipelineStage::progress_percentage(7), 100);
    }
}
