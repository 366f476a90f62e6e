//! Retry policy: maps a failure class and attempt count to a decision.
//!
//! Pure computation; the worker turns the decision into a transition and the
//! store persists `next_attempt_at`.

use chrono::Duration;
use rand::Rng;

use crate::outcome::FailureClass;

/// What to do with a failed work item.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    /// Schedule a retry after the given delay (consumes one attempt).
    Backoff(Duration),
    /// Schedule a retry at the external reset instant (no attempt consumed).
    AwaitReset,
    /// Park for manual inspection.
    Suspend,
    /// Retry budget exhausted or the failure is unrecoverable.
    DeadLetter,
}

/// Backoff shape and per-class retry budget.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    /// Jitter ratio; the computed delay is scaled by `1 + U(-jitter, +jitter)`.
    pub jitter: f64,
    pub cap: Duration,
    /// Attempt budget for TRANSIENT failures; exhaustion dead-letters.
    pub max_transient_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(60),
            multiplier: 2.0,
            jitter: 0.2,
            cap: Duration::hours(1),
            max_transient_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Decide the follow-up transition for a failure of `class` observed
    /// after `attempt_count` already-consumed attempts.
    pub fn decide(&self, class: FailureClass, attempt_count: u32) -> RetryDecision {
        match class {
            FailureClass::Transient => {
                if attempt_count >= self.max_transient_attempts {
                    RetryDecision::DeadLetter
                } else {
                    RetryDecision::Backoff(self.backoff_delay(attempt_count))
                }
            }
            FailureClass::RateLimit => RetryDecision::AwaitReset,
            FailureClass::Validation => RetryDecision::Suspend,
            FailureClass::Fatal => RetryDecision::DeadLetter,
        }
    }

    /// `min(base * multiplier^attempt, cap) * (1 + U(-jitter, +jitter))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.num_milliseconds().max(1) as f64;
        let raw_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.cap.num_milliseconds().max(1) as f64);
        let scaled_ms = capped_ms * (1.0 + self.jitter_factor());
        Duration::milliseconds(scaled_ms.round() as i64)
    }

    fn jitter_factor(&self) -> f64 {
        if self.jitter <= 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(-self.jitter..=self.jitter)
    }
}
