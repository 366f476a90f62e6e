//! Orchestrator configuration: one immutable record loaded at process start.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;

/// Per-service quota ceilings over the four tumbling windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaLimits {
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            tokens_per_minute: 4_000_000,
            tokens_per_day: 1_000_000_000,
            requests_per_minute: 15,
            requests_per_day: 1_500,
        }
    }
}

/// USD rates used to price recorded usage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsagePricing {
    pub input_per_1k_tokens: f64,
    pub output_per_1k_tokens: f64,
    pub per_image: f64,
}

impl Default for UsagePricing {
    fn default() -> Self {
        Self {
            input_per_1k_tokens: 0.000_018_75,
            output_per_1k_tokens: 0.000_037_5,
            per_image: 0.000_131_5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Parallel workers per process.
    pub num_workers: usize,
    /// Lock lease duration; workers extend at a third of this.
    pub lock_lease: Duration,
    /// Per-stage hard timeout.
    pub stage_timeout: Duration,
    pub retry: RetryPolicy,
    /// Resume sweeper period.
    pub sweeper_interval: Duration,
    /// Bound on graceful shutdown.
    pub shutdown_grace: Duration,
    /// Idle worker sleep bounds (doubles from min to max while no work).
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    /// Outbox delivery retry bounds on subscriber failure.
    pub event_retry_base: Duration,
    pub event_retry_cap: Duration,
    /// Per-service quota overrides; services absent here use the defaults.
    pub quota_limits: HashMap<String, QuotaLimits>,
    pub pricing: UsagePricing,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            lock_lease: Duration::from_secs(300),
            stage_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            sweeper_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(30),
            idle_backoff_min: Duration::from_millis(250),
            idle_backoff_max: Duration::from_secs(5),
            event_retry_base: Duration::from_millis(500),
            event_retry_cap: Duration::from_secs(30),
            quota_limits: HashMap::new(),
            pricing: UsagePricing::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by optional `LABELSQUOR_*` environment variables.
    /// Malformed values fail fast rather than silently falling back.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = parse_var::<usize>("LABELSQUOR_NUM_WORKERS")? {
            config.num_workers = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>("LABELSQUOR_LOCK_LEASE_SECONDS")? {
            config.lock_lease = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("LABELSQUOR_STAGE_TIMEOUT_SECONDS")? {
            config.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<i64>("LABELSQUOR_RETRY_BASE_SECONDS")? {
            config.retry.base = chrono::Duration::seconds(secs);
        }
        if let Some(mult) = parse_var::<f64>("LABELSQUOR_RETRY_MULTIPLIER")? {
            config.retry.multiplier = mult;
        }
        if let Some(jitter) = parse_var::<f64>("LABELSQUOR_RETRY_JITTER")? {
            config.retry.jitter = jitter;
        }
        if let Some(secs) = parse_var::<i64>("LABELSQUOR_RETRY_CAP_SECONDS")? {
            config.retry.cap = chrono::Duration::seconds(secs);
        }
        if let Some(n) = parse_var::<u32>("LABELSQUOR_MAX_TRANSIENT_ATTEMPTS")? {
            config.retry.max_transient_attempts = n;
        }
        if let Some(secs) = parse_var::<u64>("LABELSQUOR_SWEEPER_INTERVAL_SECONDS")? {
            config.sweeper_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("LABELSQUOR_SHUTDOWN_GRACE_SECONDS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_quota_limits(mut self, service: impl Into<String>, limits: QuotaLimits) -> Self {
        self.quota_limits.insert(service.into(), limits);
        self
    }

    pub fn limits_for(&self, service: &str) -> QuotaLimits {
        self.quota_limits
            .get(service)
            .copied()
            .unwrap_or_default()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| OrchestratorError::Config(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_free_tier_limits() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.lock_lease, Duration::from_secs(300));
        let limits = config.limits_for("vision");
        assert_eq!(limits.tokens_per_minute, 4_000_000);
        assert_eq!(limits.requests_per_minute, 15);
    }

    #[test]
    fn overrides_take_precedence_per_service() {
        let config = OrchestratorConfig::default().with_quota_limits(
            "vision",
            QuotaLimits {
                requests_per_minute: 2,
                ..QuotaLimits::default()
            },
        );
        assert_eq!(config.limits_for("vision").requests_per_minute, 2);
        assert_eq!(config.limits_for("search").requests_per_minute, 15);
    }
}
