use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single failed lookup call, as classified by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// The service answered: there is nothing for this key.
    #[error("not found")]
    NotFound,
    /// Timeouts, throttling, 5xx. Worth another try.
    #[error("transient lookup error: {0}")]
    Transient(String),
    /// The request itself is wrong or the answer is unusable.
    #[error("permanent lookup error: {0}")]
    Permanent(String),
}

impl Failure {
    pub fn is_transient(&self) -> bool {
        matches!(self, Failure::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total calls per key, first attempt included.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { backoff: Duration },
    /// Cache a definitive negative answer.
    Tombstone,
    /// Give up for this run; nothing is cached so a later run tries again.
    LeaveUnresolved,
}

/// Decide what to do after `attempt` calls (1-based) ended in `failure`.
pub fn decide(attempt: u32, failure: &Failure, policy: &RetryPolicy) -> RetryDecision {
    match failure {
        Failure::NotFound => RetryDecision::Tombstone,
        Failure::Permanent(_) => RetryDecision::LeaveUnresolved,
        Failure::Transient(_) if attempt < policy.max_attempts => RetryDecision::Retry {
            backoff: policy.backoff_for(attempt),
        },
        Failure::Transient(_) => RetryDecision::LeaveUnresolved,
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
