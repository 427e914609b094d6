use crate::crm::CrmErrorKind;
use crate::job::FailureClass;
use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff policy for failed job steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before the job is declared dead.
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Upper bound for any delay (milliseconds)
    pub max_delay_ms: u64,

    pub multiplier: f64,

    /// Spread delays by +/-20% so retries of a burst do not align.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// What to do after a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(FailureClass),
}

impl RetryPolicy {
    /// Decide the follow-up for a failure, given the attempts made so far
    /// (including the one that just failed).
    pub fn decide(&self, attempts_made: u32, kind: CrmErrorKind) -> RetryDecision {
        if kind == CrmErrorKind::Permanent {
            return RetryDecision::GiveUp(FailureClass::AdapterPermanent);
        }
        if attempts_made >= self.max_attempts.max(1) {
            return RetryDecision::GiveUp(FailureClass::MaxAttemptsExceeded);
        }
        RetryDecision::RetryAfter(self.delay_for(attempts_made))
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        if raw.is_finite() {
            raw.min(self.max_delay_ms as f64) as u64
        } else {
            self.max_delay_ms
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let millis = if self.jitter && base > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
            ((base as f64 * factor) as u64).min(self.max_delay_ms)
        } else {
            base
        };
        Duration::milliseconds(millis.min(i64::MAX as u64) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 10_000,
            ..policy()
        };
        assert_eq!(policy.base_delay_ms(1), 2_000);
        assert_eq!(policy.base_delay_ms(2), 4_000);
        assert_eq!(policy.base_delay_ms(3), 8_000);
        assert_eq!(policy.base_delay_ms(4), 10_000);
        assert_eq!(policy.base_delay_ms(40), 10_000);
    }

    #[test]
    fn permanent_failure_gives_up_immediately() {
        assert_eq!(
            policy().decide(1, CrmErrorKind::Permanent),
            RetryDecision::GiveUp(FailureClass::AdapterPermanent)
        );
    }

    #[test]
    fn transient_failure_gives_up_at_max_attempts() {
        let policy = policy();
        assert!(matches!(
            policy.decide(4, CrmErrorKind::Transient),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.decide(5, CrmErrorKind::Transient),
            RetryDecision::GiveUp(FailureClass::MaxAttemptsExceeded)
        );
    }

    proptest! {
        #[test]
        fn jittered_delay_never_exceeds_cap(
            attempt in 1u32..100,
            initial in 1u64..60_000,
            max in 1u64..600_000,
            multiplier in 1.0f64..10.0,
        ) {
            let policy = RetryPolicy {
                max_attempts: 5,
                initial_delay_ms: initial,
                max_delay_ms: max,
                multiplier,
                jitter: true,
            };
            let delay = policy.delay_for(attempt);
            prop_assert!(delay.num_milliseconds() >= 0);
            prop_assert!(delay.num_milliseconds() as u64 <= max);
        }

        #[test]
        fn base_delay_is_monotonic(attempt in 1u32..80, multiplier in 1.0f64..5.0) {
            let policy = RetryPolicy { multiplier, ..policy() };
            prop_assert!(policy.base_delay_ms(attempt) <= policy.base_delay_ms(attempt + 1));
        }

        #[test]
        fn never_retries_past_max_attempts(max_attempts in 1u32..20, attempts in 0u32..40) {
            let policy = RetryPolicy { max_attempts, ..policy() };
            let decision = policy.decide(attempts, CrmErrorKind::Transient);
            if attempts >= max_attempts {
                prop_assert_eq!(decision, RetryDecision::GiveUp(FailureClass::MaxAttemptsExceeded));
            } else {
                prop_assert!(matches!(decision, RetryDecision::RetryAfter(_)), "expected retry");
            }
        }
    }
}
