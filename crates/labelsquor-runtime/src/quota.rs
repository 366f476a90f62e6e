//! Quota tracking for external services.
//!
//! Four tumbling windows per service (token and request ceilings over a UTC
//! minute and a UTC day). `check` + `record` is deliberately not atomic
//! across workers: a small over-commit (one in-flight request per worker per
//! window) is accepted, and quota errors raised by the service itself
//! re-converge the counters through the QUOTA_EXCEEDED path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use labelsquor_workflow::{OrchestratorConfig, QuotaLimits, Result, UsagePricing};

use crate::models::{QuotaUsage, QuotaWindow};
use crate::store::{limit_for_window, SqliteWorkflowStore};

/// Outcome of a pre-call quota check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QuotaDecision {
    Allow,
    /// At least one window would be exceeded; `reset_at` is the earliest
    /// instant any exceeded window tumbles.
    Deny { reset_at: DateTime<Utc> },
}

impl QuotaDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, QuotaDecision::Allow)
    }
}

/// Utilization snapshot for one window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaWindowStatus {
    pub window: QuotaWindow,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percent_used: f64,
    pub window_start: DateTime<Utc>,
}

/// Utilization snapshot for a service, for the observability surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub service: String,
    pub windows: Vec<QuotaWindowStatus>,
    pub total_cost_usd: f64,
}

#[derive(Clone)]
pub struct QuotaManager {
    store: Arc<SqliteWorkflowStore>,
    config: Arc<OrchestratorConfig>,
}

impl QuotaManager {
    pub fn new(store: Arc<SqliteWorkflowStore>, config: Arc<OrchestratorConfig>) -> Self {
        Self { store, config }
    }

    /// Limit for one window: a persisted counter row wins over configured
    /// limits, configuration wins over built-in defaults.
    fn window_limit(
        &self,
        persisted: Option<u64>,
        limits: &QuotaLimits,
        window: QuotaWindow,
    ) -> u64 {
        persisted.unwrap_or_else(|| limit_for_window(limits, window))
    }

    /// Evaluate every window against the estimated call. Token windows are
    /// charged `estimated_tokens`; request windows one request.
    pub fn check(
        &self,
        service: &str,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let limits = self.config.limits_for(service);
        let counters = self.store.quota_counters(service)?;
        let mut earliest_reset: Option<DateTime<Utc>> = None;
        for window in QuotaWindow::ALL {
            let persisted = counters.iter().find(|c| c.window == window);
            let limit = self.window_limit(persisted.map(|c| c.limit), &limits, window);
            let used = persisted.map(|c| c.effective_used(now)).unwrap_or(0);
            let increment = if window.counts_tokens() {
                estimated_tokens
            } else {
                1
            };
            if used + increment > limit {
                let reset = window.next_reset(now);
                earliest_reset = Some(match earliest_reset {
                    Some(current) if current <= reset => current,
                    _ => reset,
                });
            }
        }
        Ok(match earliest_reset {
            Some(reset_at) => QuotaDecision::Deny { reset_at },
            None => QuotaDecision::Allow,
        })
    }

    /// Post-call accounting: bump every window, price the call, and append
    /// the usage log row. Returns the computed USD cost.
    pub fn record(
        &self,
        service: &str,
        usage: &QuotaUsage,
        work_item_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let limits = self.config.limits_for(service);
        self.store
            .add_quota_usage(service, &limits, usage.total_tokens(), 1, now)?;
        let cost = price_usage(usage, &self.config.pricing);
        self.store
            .append_quota_usage_log(service, work_item_id, usage, cost, now)?;
        tracing::debug!(
            service,
            tokens = usage.total_tokens(),
            images = usage.image_count,
            cost_usd = cost,
            "quota usage recorded"
        );
        Ok(cost)
    }

    /// Earliest instant an exceeded window resets, or the next minute
    /// boundary when nothing is currently exceeded.
    pub fn reset_instant(&self, service: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.check(service, 0, now)? {
            QuotaDecision::Deny { reset_at } => Ok(reset_at),
            QuotaDecision::Allow => Ok(QuotaWindow::TokensPerMinute.next_reset(now)),
        }
    }

    /// Whether a resumption-sized call would currently be allowed.
    pub fn has_capacity(&self, service: &str, estimated_tokens: u64, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.check(service, estimated_tokens, now)?.is_allowed())
    }

    pub fn status(&self, service: &str, now: DateTime<Utc>) -> Result<QuotaStatus> {
        let limits = self.config.limits_for(service);
        let counters = self.store.quota_counters(service)?;
        let windows = QuotaWindow::ALL
            .iter()
            .map(|&window| {
                let persisted = counters.iter().find(|c| c.window == window);
                let limit = self.window_limit(persisted.map(|c| c.limit), &limits, window);
                let used = persisted.map(|c| c.effective_used(now)).unwrap_or(0);
                let window_start = persisted
                    .map(|c| c.window_start)
                    .unwrap_or_else(|| window.window_start(now));
                QuotaWindowStatus {
                    window,
                    used,
                    limit,
                    remaining: limit.saturating_sub(used),
                    percent_used: if limit > 0 {
                        (used as f64 / limit as f64) * 100.0
                    } else {
                        0.0
                    },
                    window_start,
                }
            })
            .collect();
        Ok(QuotaStatus {
            service: service.to_string(),
            windows,
            total_cost_usd: self.store.quota_cost_total(service)?,
        })
    }
}

fn price_usage(usage: &QuotaUsage, pricing: &UsagePricing) -> f64 {
    (usage.input_tokens as f64 / 1000.0) * pricing.input_per_1k_tokens
        + (usage.output_tokens as f64 / 1000.0) * pricing.output_per_1k_tokens
        + usage.image_count as f64 * pricing.per_image
}
