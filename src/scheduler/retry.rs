//! Retry decisions for failed step attempts.

use std::time::Duration;

use crate::policy::RetryPolicy;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Fire the step again after the delay.
    Reschedule { delay: Duration },
    /// Attempt budget spent; finalize the step `FAILED`.
    Exhausted,
}

/// Applies the policy's retry budget, falling back to configured defaults
/// where the policy leaves a field unset.
#[derive(Debug, Clone, Copy)]
pub struct RetryEngine {
    default_delay: Duration,
}

impl RetryEngine {
    pub fn new(default_delay: Duration) -> Self {
        Self { default_delay }
    }

    /// Decide based on the attempts already made (`run_count` counts the
    /// attempt that just failed). `attempts == 0` disables retries.
    pub fn decide(&self, policy: &RetryPolicy, run_count: u32) -> RetryDecision {
        if run_count >= policy.attempts {
            return RetryDecision::Exhausted;
        }
        let delay = if policy.delay_seconds > 0 {
            Duration::from_secs(policy.delay_seconds)
        } else {
            self.default_delay
        };
        RetryDecision::Reschedule { delay }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_of_three_allows_exactly_three_attempts() {
        let engine = RetryEngine::default();
        let policy = RetryPolicy::default();
        assert_eq!(
            engine.decide(&policy, 1),
            RetryDecision::Reschedule {
                delay: Duration::from_secs(1800)
            }
        );
        assert_eq!(
            engine.decide(&policy, 2),
            RetryDecision::Reschedule {
                delay: Duration::from_secs(1800)
            }
        );
        assert_eq!(engine.decide(&policy, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_attempts_disables_retries() {
        let engine = RetryEngine::default();
        let policy = RetryPolicy {
            attempts: 0,
            delay_seconds: 60,
        };
        assert_eq!(engine.decide(&policy, 1), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_delay_falls_back_to_default() {
        let engine = RetryEngine::new(Duration::from_secs(900));
        let policy = RetryPolicy {
            attempts: 5,
            delay_seconds: 0,
        };
        assert_eq!(
            engine.decide(&policy, 1),
            RetryDecision::Reschedule {
                delay: Duration::from_secs(900)
            }
        );
    }
}
