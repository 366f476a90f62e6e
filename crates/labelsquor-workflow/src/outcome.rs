//! Stage outcomes and the failure taxonomy.
//!
//! Stage handlers are external collaborators; the executor normalizes
//! whatever they do into a [StageOutcome]. Failures carry a [FailureClass]
//! so the retry policy can map them to transitions without inspecting
//! error text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a stage failure should be treated downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network errors, 5xx, timeouts. Retried with exponential backoff.
    Transient,
    /// External rate-limit signal with its own reset hint. Retried at the
    /// hint without consuming the attempt budget.
    RateLimit,
    /// Bad input or schema mismatch. Parked for manual inspection.
    Validation,
    /// Unrecoverable. Dead-lettered immediately.
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimit => "rate_limit",
            FailureClass::Validation => "validation",
            FailureClass::Fatal => "fatal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(FailureClass::Transient),
            "rate_limit" => Some(FailureClass::RateLimit),
            "validation" => Some(FailureClass::Validation),
            "fatal" => Some(FailureClass::Fatal),
            _ => None,
        }
    }
}

/// Typed stage failure raised by a handler or synthesized by the executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageFailure {
    pub class: FailureClass,
    pub reason: String,
    /// When a rate limiter supplied its own reset hint.
    pub retry_at: Option<DateTime<Utc>>,
    pub details: Option<Value>,
}

impl StageFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            reason: reason.into(),
            retry_at: None,
            details: None,
        }
    }

    pub fn rate_limit(reason: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        Self {
            class: FailureClass::RateLimit,
            reason: reason.into(),
            retry_at: Some(retry_at),
            details: None,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Validation,
            reason: reason.into(),
            retry_at: None,
            details: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Fatal,
            reason: reason.into(),
            retry_at: None,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.reason)
    }
}

/// Normalized result of one stage execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage finished; `summary` is persisted into the item's partial
    /// results under the stage key.
    Done { summary: Value },
    /// Stage failed with a classified error.
    Failed { failure: StageFailure },
    /// An external service's quota is exhausted; the item parks until
    /// `reset_at` with its progress preserved.
    QuotaExceeded {
        service: String,
        reset_at: DateTime<Utc>,
        partial: Option<Value>,
    },
    /// Stage yielded pending an external signal; the item parks in WAITING
    /// at the same stage until woken.
    Partial { summary: Value },
}

impl StageOutcome {
    pub fn done(summary: Value) -> Self {
        StageOutcome::Done { summary }
    }

    pub fn failed(failure: StageFailure) -> Self {
        StageOutcome::Failed { failure }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_class_strings_round_trip() {
        for class in [
            FailureClass::Transient,
            FailureClass::RateLimit,
            FailureClass::Validation,
            FailureClass::Fatal,
        ] {
            assert_eq!(FailureClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(FailureClass::parse("mystery"), None);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = StageOutcome::done(json!({"images": 3}));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "done");
        assert_eq!(value["summary"]["images"], 3);
    }

    #[test]
    fn stage_failure_display_includes_class() {
        let failure = StageFailure::validation("missing nutrition panel");
        assert_eq!(failure.to_string(), "validation: missing nutrition panel");
    }
}
