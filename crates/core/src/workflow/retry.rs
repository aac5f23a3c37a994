//! Retry and backoff policy for failed node attempts.

use super::dag::NodeSpec;
use super::state::NodeState;
use crate::types::NodeError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Delay between a failed attempt and the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { secs: u64 },
    /// `base_secs * 2^(attempt - 1)`, capped at `max_secs`
    Exponential { base_secs: u64, max_secs: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { secs: 1 }
    }
}

impl Backoff {
    /// Delay after `attempt` (1-based) failed
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = match *self {
            Self::Fixed { secs } => secs,
            Self::Exponential {
                base_secs,
                max_secs,
            } => {
                let exponent = attempt.saturating_sub(1).min(32);
                base_secs
                    .saturating_mul(2_u64.saturating_pow(exponent))
                    .min(max_secs)
            }
        };
        crate::clock::saturating_seconds(secs)
    }

    /// Largest delay this backoff can produce, in seconds
    pub fn max_secs(&self) -> u64 {
        match *self {
            Self::Fixed { secs } => secs,
            Self::Exponential {
                base_secs,
                max_secs,
            } => base_secs.max(max_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    GiveUp,
}

pub struct RetryPolicy<'a> {
    spec: &'a NodeSpec,
}

impl<'a> RetryPolicy<'a> {
    pub fn new(spec: &'a NodeSpec) -> Self {
        Self { spec }
    }

    /// Attempts allowed for the node, including operator grants
    pub fn attempt_cap(&self, state: &NodeState) -> u32 {
        self.spec.max_attempts.saturating_add(state.extra_attempts)
    }

    pub fn decide(&self, state: &NodeState, error: &NodeError, now: DateTime<Utc>) -> RetryDecision {
        if !error.retriable || state.attempt_count >= self.attempt_cap(state) {
            return RetryDecision::GiveUp;
        }
        match now.checked_add_signed(self.spec.backoff.delay(state.attempt_count)) {
            Some(at) => RetryDecision::Retry { at },
            None => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base_secs: 2,
            max_secs: 10,
        };
        assert_eq!(backoff.delay(1), Duration::seconds(2));
        assert_eq!(backoff.delay(2), Duration::seconds(4));
        assert_eq!(backoff.delay(3), Duration::seconds(8));
        assert_eq!(backoff.delay(4), Duration::seconds(10));
        assert_eq!(backoff.delay(60), Duration::seconds(10));
    }

    #[test]
    fn test_huge_backoff_saturates() {
        let backoff = Backoff::Exponential {
            base_secs: u64::MAX,
            max_secs: u64::MAX,
        };
        let cap = crate::clock::saturating_seconds(crate::clock::MAX_DURATION_SECS);
        assert_eq!(backoff.delay(40), cap);
        assert_eq!(Backoff::Fixed { secs: u64::MAX }.delay(1), cap);

        let mut spec = NodeSpec::new("b", "flaky");
        spec.max_attempts = 3;
        spec.backoff = backoff;
        let mut state = NodeState::default();
        state.attempt_count = 1;
        let error = NodeError::retriable("network", "connection reset");
        assert_eq!(
            RetryPolicy::new(&spec).decide(&state, &error, DateTime::<Utc>::MAX_UTC),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_retry_until_cap() {
        let mut spec = NodeSpec::new("b", "flaky");
        spec.max_attempts = 3;
        spec.backoff = Backoff::Fixed { secs: 5 };
        let policy = RetryPolicy::new(&spec);
        let now = Utc::now();
        let error = NodeError::retriable("network", "connection reset");

        let mut state = NodeState::default();
        state.attempt_count = 2;
        assert_eq!(
            policy.decide(&state, &error, now),
            RetryDecision::Retry {
                at: now + Duration::seconds(5)
            }
        );

        state.attempt_count = 3;
        assert_eq!(policy.decide(&state, &error, now), RetryDecision::GiveUp);

        // Operator grant lifts the cap by one
        state.extra_attempts = 1;
        assert!(matches!(
            policy.decide(&state, &error, now),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let mut spec = NodeSpec::new("b", "call");
        spec.max_attempts = 5;
        let policy = RetryPolicy::new(&spec);
        let mut state = NodeState::default();
        state.attempt_count = 1;

        let error = NodeError::permanent("unauthorized", "token rejected");
        assert_eq!(policy.decide(&state, &error, Utc::now()), RetryDecision::GiveUp);
    }
}
