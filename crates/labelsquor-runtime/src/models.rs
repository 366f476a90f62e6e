//! Durable domain records for the workflow runtime.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labelsquor_workflow::{FailureClass, PipelineStage, WorkItemState};

/// The unit orchestrated through the pipeline. This is both the persisted
/// row and the read-only snapshot handed to stage handlers and API callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub priority: i64,
    pub state: WorkItemState,
    pub stage: PipelineStage,
    pub attempt_count: u32,
    pub quota_exceeded_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lock_holder: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; bumped by every compare-and-transition.
    pub version: u64,
    /// Opaque reference consumed by stage handlers (e.g. a product version id).
    pub payload: Value,
    /// Completed-stage -> stage output summary. Ordered for stable JSON.
    pub partial_results: BTreeMap<String, Value>,
    pub last_error: Option<LastError>,
    /// Set by `cancel()` on a RUNNING item; observed at stage boundaries.
    pub cancel_requested: bool,
    /// Service that paused this item, while in QUOTA_EXCEEDED.
    pub quota_service: Option<String>,
}

impl WorkItem {
    /// Completed stages, in pipeline order.
    pub fn completed_stages(&self) -> Vec<PipelineStage> {
        PipelineStage::ORDER
            .iter()
            .copied()
            .filter(|s| self.partial_results.contains_key(s.as_str()))
            .collect()
    }

    pub fn progress_percentage(&self) -> u8 {
        PipelineStage::progress_percentage(self.completed_stages().len())
    }

    /// Whether the lease has lapsed and the item is reclaimable at `now`.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_expires_at, Some(expires) if expires < now)
    }
}

/// Last classified failure observed for a work item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastError {
    pub class: FailureClass,
    pub message: String,
}

/// Immutable audit record of one state change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub work_item_id: String,
    pub from_state: WorkItemState,
    pub to_state: WorkItemState,
    pub stage: Option<PipelineStage>,
    pub reason: String,
    pub metadata: Option<Value>,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Durable outbox event types delivered to subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateChanged,
    StageStarted,
    StageCompleted,
    StageFailed,
    QuotaExceeded,
    Resumed,
    Locked,
    Unlocked,
    DeadLettered,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StateChanged => "state_changed",
            EventType::StageStarted => "stage_started",
            EventType::StageCompleted => "stage_completed",
            EventType::StageFailed => "stage_failed",
            EventType::QuotaExceeded => "quota_exceeded",
            EventType::Resumed => "resumed",
            EventType::Locked => "locked",
            EventType::Unlocked => "unlocked",
            EventType::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "state_changed" => Some(EventType::StateChanged),
            "stage_started" => Some(EventType::StageStarted),
            "stage_completed" => Some(EventType::StageCompleted),
            "stage_failed" => Some(EventType::StageFailed),
            "quota_exceeded" => Some(EventType::QuotaExceeded),
            "resumed" => Some(EventType::Resumed),
            "locked" => Some(EventType::Locked),
            "unlocked" => Some(EventType::Unlocked),
            "dead_lettered" => Some(EventType::DeadLettered),
            _ => None,
        }
    }
}

/// Outbox row; `delivered` flips once every subscriber has accepted it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub work_item_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub at: DateTime<Utc>,
    pub delivered: bool,
}

/// Numeric observation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    StateDurationMs,
    StageDurationMs,
    RetryCount,
    Error,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::StateDurationMs => "state_duration_ms",
            MetricKind::StageDurationMs => "stage_duration_ms",
            MetricKind::RetryCount => "retry_count",
            MetricKind::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "state_duration_ms" => Some(MetricKind::StateDurationMs),
            "stage_duration_ms" => Some(MetricKind::StageDurationMs),
            "retry_count" => Some(MetricKind::RetryCount),
            "error" => Some(MetricKind::Error),
            _ => None,
        }
    }
}

/// Tumbling quota windows, aligned to UTC minute/day boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    TokensPerMinute,
    TokensPerDay,
    RequestsPerMinute,
    RequestsPerDay,
}

impl QuotaWindow {
    pub const ALL: [QuotaWindow; 4] = [
        QuotaWindow::TokensPerMinute,
        QuotaWindow::TokensPerDay,
        QuotaWindow::RequestsPerMinute,
        QuotaWindow::RequestsPerDay,
    ];

    pub fn counts_tokens(self) -> bool {
        matches!(self, QuotaWindow::TokensPerMinute | QuotaWindow::TokensPerDay)
    }

    pub fn length(self) -> Duration {
        match self {
            QuotaWindow::TokensPerMinute | QuotaWindow::RequestsPerMinute => Duration::minutes(1),
            QuotaWindow::TokensPerDay | QuotaWindow::RequestsPerDay => Duration::days(1),
        }
    }

    /// Start of the window containing `now`, aligned to the UTC boundary.
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            QuotaWindow::TokensPerMinute | QuotaWindow::RequestsPerMinute => Utc
                .with_ymd_and_hms(
                    now.year(),
                    now.month(),
                    now.day(),
                    now.hour(),
                    now.minute(),
                    0,
                )
                .single()
                .unwrap_or(now),
            QuotaWindow::TokensPerDay | QuotaWindow::RequestsPerDay => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .unwrap_or(now),
        }
    }

    /// First instant at which the window containing `now` tumbles.
    pub fn next_reset(self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.window_start(now) + self.length()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaWindow::TokensPerMinute => "tokens_per_minute",
            QuotaWindow::TokensPerDay => "tokens_per_day",
            QuotaWindow::RequestsPerMinute => "requests_per_minute",
            QuotaWindow::RequestsPerDay => "requests_per_day",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|w| w.as_str() == value)
    }
}

/// Persisted counter for one (service, window) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub service: String,
    pub window: QuotaWindow,
    pub limit: u64,
    pub used: u64,
    pub window_start: DateTime<Utc>,
}

impl QuotaCounter {
    /// Usage visible at `now`; zero once the window has tumbled.
    pub fn effective_used(&self, now: DateTime<Utc>) -> u64 {
        if now >= self.window_start + self.window.length() {
            0
        } else {
            self.used
        }
    }
}

/// Actual usage reported by a stage handler after an external call.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_count: u32,
}

impl QuotaUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Append-only record of one external call's cost.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaUsageLogRow {
    pub id: i64,
    pub service: String,
    pub work_item_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_count: u32,
    pub cost: f64,
    pub at: DateTime<Utc>,
}

/// Terminal record for items that exhausted their retry budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub id: i64,
    pub work_item_id: String,
    pub error_chain: Value,
    pub at: DateTime<Utc>,
}

/// Claim candidate surfaced by the dispatch query. A `Running` candidate is
/// a reclaim: its lease expired with the owner gone.
#[derive(Clone, Debug)]
pub struct DispatchCandidate {
    pub work_item_id: String,
    pub state: WorkItemState,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// Filter for the read-only listing surface.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub state: Option<WorkItemState>,
    pub stage: Option<PipelineStage>,
    pub min_priority: Option<i64>,
    pub max_age: Option<Duration>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minute_window_aligns_to_utc_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 10, 42, 31).unwrap();
        let start = QuotaWindow::TokensPerMinute.window_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 7, 10, 42, 0).unwrap());
        assert_eq!(
            QuotaWindow::TokensPerMinute.next_reset(now),
            Utc.with_ymd_and_hms(2025, 3, 7, 10, 43, 0).unwrap()
        );
    }

    #[test]
    fn day_window_aligns_to_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 10, 42, 31).unwrap();
        let start = QuotaWindow::RequestsPerDay.window_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 7, 0, 0, 0).unwrap());
    }

    #[test]
    fn tumbled_counter_reads_zero() {
        let window_start = Utc.with_ymd_and_hms(2025, 3, 7, 10, 41, 0).unwrap();
        let counter = QuotaCounter {
            service: "vision".into(),
            window: QuotaWindow::RequestsPerMinute,
            limit: 15,
            used: 15,
            window_start,
        };
        let inside = window_start + Duration::seconds(30);
        let after = window_start + Duration::seconds(61);
        assert_eq!(counter.effective_used(inside), 15);
        assert_eq!(counter.effective_used(after), 0);
    }

    #[test]
    fn completed_stages_follow_pipeline_order() {
        let mut partial = BTreeMap::new();
        partial.insert("image_fetch".to_string(), json!({"images": 2}));
        partial.insert("discovery".to_string(), json!({"source": "bigbasket"}));
        let item = WorkItem {
            id: "wi-1".into(),
            priority: 0,
            state: WorkItemState::QuotaExceeded,
            stage: PipelineStage::Enrichment,
            attempt_count: 0,
            quota_exceeded_count: 1,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            lock_holder: None,
            lock_acquired_at: None,
            lock_expires_at: None,
            version: 3,
            payload: json!({}),
            partial_results: partial,
            last_error: None,
            cancel_requested: false,
            quota_service: Some("vision".into()),
        };
        assert_eq!(
            item.completed_stages(),
            vec![PipelineStage::Discovery, PipelineStage::ImageFetch]
        );
        assert_eq!(item.progress_percentage(), 28);
    }
}
