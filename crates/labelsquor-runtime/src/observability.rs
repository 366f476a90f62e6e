//! Read-only aggregations over the durable tables: state distribution,
//! throughput, latency percentiles, error breakdown, quota utilization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use labelsquor_workflow::{PipelineStage, Result, WorkItemState};

use crate::models::MetricKind;
use crate::quota::{QuotaManager, QuotaStatus};
use crate::store::SqliteWorkflowStore;

/// Percentile summary over one duration series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DurationSummary {
    pub name: String,
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsReport {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub state_distribution: Vec<(WorkItemState, u64)>,
    /// Items that reached COMPLETED inside the range.
    pub throughput_completed: u64,
    pub state_durations: Vec<DurationSummary>,
    pub stage_durations: Vec<DurationSummary>,
    pub error_breakdown: Vec<(String, u64)>,
    pub quota_exceeded_count: u64,
    pub quota: Vec<QuotaStatus>,
}

#[derive(Clone)]
pub struct ObservabilityView {
    store: Arc<SqliteWorkflowStore>,
    quota: Arc<QuotaManager>,
}

impl ObservabilityView {
    pub fn new(store: Arc<SqliteWorkflowStore>, quota: Arc<QuotaManager>) -> Self {
        Self { store, quota }
    }

    pub fn metrics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        services: &[&str],
    ) -> Result<MetricsReport> {
        let mut state_durations = Vec::new();
        for state in [
            WorkItemState::Ready,
            WorkItemState::Running,
            WorkItemState::RetryScheduled,
            WorkItemState::QuotaExceeded,
            WorkItemState::Waiting,
        ] {
            if let Some(summary) = self.duration_summary(
                MetricKind::StateDurationMs,
                state.as_str(),
                since,
                until,
            )? {
                state_durations.push(summary);
            }
        }

        let mut stage_durations = Vec::new();
        for stage in PipelineStage::ORDER {
            if let Some(summary) = self.duration_summary(
                MetricKind::StageDurationMs,
                stage.as_str(),
                since,
                until,
            )? {
                stage_durations.push(summary);
            }
        }

        let mut quota = Vec::new();
        let now = Utc::now();
        for service in services {
            quota.push(self.quota.status(service, now)?);
        }

        Ok(MetricsReport {
            since,
            until,
            state_distribution: self.store.state_counts()?,
            throughput_completed: self
                .store
                .count_transitions_to(WorkItemState::Completed, since, until)?,
            state_durations,
            stage_durations,
            error_breakdown: self
                .store
                .metric_count_by_name(MetricKind::Error, since, until)?,
            quota_exceeded_count: self
                .store
                .count_transitions_to(WorkItemState::QuotaExceeded, since, until)?,
            quota,
        })
    }

    fn duration_summary(
        &self,
        kind: MetricKind,
        name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<DurationSummary>> {
        let values = self.store.metric_values(kind, Some(name), since, until)?;
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(DurationSummary {
            name: name.to_string(),
            count: values.len(),
            p50_ms: percentile(&values, 0.50),
            p95_ms: percentile(&values, 0.95),
        }))
    }
}

/// Nearest-rank percentile over an ascending-sorted series.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::store::TransitionRequest;
    use labelsquor_workflow::OrchestratorConfig;

    #[test]
    fn percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        assert_eq!(percentile(&values, 0.50), 50.0);
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
    }

    #[test]
    fn report_aggregates_counts_and_latencies() {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-obs-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let quota = Arc::new(QuotaManager::new(
            Arc::clone(&store),
            Arc::new(OrchestratorConfig::default()),
        ));
        let view = ObservabilityView::new(Arc::clone(&store), quota);

        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        store.insert_work_item("wi-1", &json!({}), 0, t0).unwrap();
        store
            .compare_and_transition(
                &TransitionRequest::new(
                    "wi-1",
                    0,
                    WorkItemState::Created,
                    WorkItemState::Ready,
                    "enqueued",
                    "ingress",
                ),
                t0,
            )
            .unwrap();
        for (i, value) in [40.0, 60.0, 80.0].iter().enumerate() {
            store
                .record_metric(
                    Some("wi-1"),
                    MetricKind::StageDurationMs,
                    "discovery",
                    *value,
                    t0 + Duration::seconds(i as i64),
                )
                .unwrap();
        }

        let report = view
            .metrics(t0 - Duration::hours(1), t0 + Duration::hours(1), &[])
            .unwrap();
        assert_eq!(
            report.state_distribution,
            vec![(WorkItemState::Ready, 1)]
        );
        assert_eq!(report.throughput_completed, 0);
        let discovery = report
            .stage_durations
            .iter()
            .find(|s| s.name == "discovery")
            .unwrap();
        assert_eq!(discovery.count, 3);
        assert_eq!(discovery.p50_ms, 60.0);
        assert_eq!(discovery.p95_ms, 80.0);
    }
}
