//! Trigger construction and fire planning.
//!
//! A [`TriggerSpec`] is the serializable schedule descriptor compiled from a
//! policy's frequency and optional start/end window. Validation happens at
//! construction, before anything is registered, so an inconsistent window
//! never reaches the engine. At run time the spec is lowered into a
//! [`FirePlan`] of relative delays which the trigger loop turns into timer
//! waits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Construction-time trigger validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("trigger frequency must be greater than zero")]
    ZeroFrequency,
    #[error("trigger end time {0} is already in the past")]
    EndInPast(DateTime<Utc>),
    #[error("trigger end time {end} is not after start time {start}")]
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Schedule descriptor for a policy's recurring fires, or a one-shot retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire immediately, then every `frequency_seconds` forever.
    NeverEnding { frequency_seconds: u64 },
    /// Fire immediately, then every `frequency_seconds` until `end`.
    FixedEnd {
        frequency_seconds: u64,
        end: DateTime<Utc>,
    },
    /// First fire at `start`, then every `frequency_seconds` forever.
    FutureStart {
        frequency_seconds: u64,
        start: DateTime<Utc>,
    },
    /// First fire at `start`, then every `frequency_seconds` until `end`.
    Window {
        frequency_seconds: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Single fire after `delay_seconds`, used for retried step attempts.
    OneShot { delay_seconds: u64 },
}

/// Relative firing schedule derived from a [`TriggerSpec`] at a moment in
/// time. All delays are measured from that moment so the trigger loop can
/// drive tokio timers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirePlan {
    /// Delay until the first fire.
    pub initial_delay: Duration,
    /// Delay between subsequent fires; `None` for a one-shot.
    pub interval: Option<Duration>,
    /// Elapsed time after which no further fires occur; `None` means
    /// never-ending.
    pub expires_after: Option<Duration>,
}

impl FirePlan {
    /// True when the plan produces no fire at all. The end bound is
    /// exclusive: a first fire landing exactly on it is already too late,
    /// and a window that closed in the past clamps both delays to zero.
    pub fn is_spent(&self) -> bool {
        matches!(self.expires_after, Some(expiry) if expiry <= self.initial_delay)
    }
}

impl TriggerSpec {
    /// Build a recurring trigger from a policy's schedule window, validating
    /// the window against `now`.
    pub fn build(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        frequency_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, TriggerError> {
        if frequency_seconds == 0 {
            return Err(TriggerError::ZeroFrequency);
        }
        match (start, end) {
            (None, None) => Ok(Self::NeverEnding { frequency_seconds }),
            (None, Some(end)) => {
                if end <= now {
                    return Err(TriggerError::EndInPast(end));
                }
                Ok(Self::FixedEnd {
                    frequency_seconds,
                    end,
                })
            }
            (Some(start), None) => Ok(Self::FutureStart {
                frequency_seconds,
                start,
            }),
            (Some(start), Some(end)) => {
                if end <= start {
                    return Err(TriggerError::EndBeforeStart { start, end });
                }
                Ok(Self::Window {
                    frequency_seconds,
                    start,
                    end,
                })
            }
        }
    }

    /// One-shot retry trigger firing after `delay`.
    pub fn one_shot(delay: Duration) -> Self {
        Self::OneShot {
            delay_seconds: delay.as_secs(),
        }
    }

    pub fn frequency(&self) -> Option<Duration> {
        match self {
            Self::NeverEnding { frequency_seconds }
            | Self::FixedEnd {
                frequency_seconds, ..
            }
            | Self::FutureStart {
                frequency_seconds, ..
            }
            | Self::Window {
                frequency_seconds, ..
            } => Some(Duration::from_secs(*frequency_seconds)),
            Self::OneShot { .. } => None,
        }
    }

    /// Lower the spec into relative delays measured from `now`.
    ///
    /// A start time already in the past is a misfire: the plan fires now and
    /// the next fire is one full interval from now. Missed ticks are not
    /// replayed individually.
    pub fn fire_plan(&self, now: DateTime<Utc>) -> FirePlan {
        match self {
            Self::NeverEnding { frequency_seconds } => FirePlan {
                initial_delay: Duration::ZERO,
                interval: Some(Duration::from_secs(*frequency_seconds)),
                expires_after: None,
            },
            Self::FixedEnd {
                frequency_seconds,
                end,
            } => FirePlan {
                initial_delay: Duration::ZERO,
                interval: Some(Duration::from_secs(*frequency_seconds)),
                expires_after: Some(delay_until(now, *end)),
            },
            Self::FutureStart {
                frequency_seconds,
                start,
            } => FirePlan {
                initial_delay: delay_until(now, *start),
                interval: Some(Duration::from_secs(*frequency_seconds)),
                expires_after: None,
            },
            Self::Window {
                frequency_seconds,
                start,
                end,
            } => FirePlan {
                initial_delay: delay_until(now, *start),
                interval: Some(Duration::from_secs(*frequency_seconds)),
                // A closed window clamps to zero and the plan reads spent.
                expires_after: Some(delay_until(now, *end)),
            },
            Self::OneShot { delay_seconds } => FirePlan {
                initial_delay: Duration::from_secs(*delay_seconds),
                interval: None,
                expires_after: None,
            },
        }
    }
}

fn delay_until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_no_window_is_immediate_and_never_ending() {
        let trigger = TriggerSpec::build(None, None, 60, now()).unwrap();
        assert_eq!(trigger, TriggerSpec::NeverEnding { frequency_seconds: 60 });

        let plan = trigger.fire_plan(now());
        assert_eq!(plan.initial_delay, Duration::ZERO);
        assert_eq!(plan.interval, Some(Duration::from_secs(60)));
        assert_eq!(plan.expires_after, None);
        assert!(!plan.is_spent());
    }

    #[test]
    fn test_end_in_past_rejected() {
        let t = now();
        let err = TriggerSpec::build(None, Some(t - TimeDelta::seconds(10)), 60, t).unwrap_err();
        assert!(matches!(err, TriggerError::EndInPast(_)));
    }

    #[test]
    fn test_end_before_start_rejected() {
        let t = now();
        let start = t + TimeDelta::seconds(100);
        let end = t + TimeDelta::seconds(50);
        let err = TriggerSpec::build(Some(start), Some(end), 60, t).unwrap_err();
        assert!(matches!(err, TriggerError::EndBeforeStart { .. }));
    }

    #[test]
    fn test_zero_frequency_rejected() {
        assert_eq!(
            TriggerSpec::build(None, None, 0, now()),
            Err(TriggerError::ZeroFrequency)
        );
    }

    #[test]
    fn test_future_start_delays_first_fire() {
        let t = now();
        let start = t + TimeDelta::seconds(300);
        let trigger = TriggerSpec::build(Some(start), None, 60, t).unwrap();
        let plan = trigger.fire_plan(t);
        assert_eq!(plan.initial_delay, Duration::from_secs(300));
        assert_eq!(plan.expires_after, None);
    }

    #[test]
    fn test_misfired_start_fires_now() {
        let t = now();
        let start = t - TimeDelta::seconds(300);
        let trigger = TriggerSpec::build(Some(start), None, 60, t).unwrap();
        let plan = trigger.fire_plan(t);
        assert_eq!(plan.initial_delay, Duration::ZERO);
        assert_eq!(plan.interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_closed_window_plan_is_spent() {
        let t = now();
        let start = t - TimeDelta::seconds(200);
        let end = t - TimeDelta::seconds(100);
        // Valid at build time, spent by plan time.
        let trigger = TriggerSpec::build(Some(start), Some(end), 60, t - TimeDelta::seconds(300))
            .unwrap();
        assert!(trigger.fire_plan(t).is_spent());
    }

    #[test]
    fn test_expired_fixed_end_plan_is_spent() {
        let t = now();
        let end = t + TimeDelta::seconds(100);
        let trigger = TriggerSpec::build(None, Some(end), 60, t).unwrap();
        assert!(!trigger.fire_plan(t).is_spent());
        // Planned again after the end time has passed (engine restart).
        assert!(trigger.fire_plan(end).is_spent());
        assert!(trigger.fire_plan(end + TimeDelta::seconds(1)).is_spent());
    }

    #[test]
    fn test_window_closing_now_no_longer_fires() {
        let t = now();
        let start = t + TimeDelta::seconds(100);
        let end = t + TimeDelta::seconds(200);
        let trigger = TriggerSpec::build(Some(start), Some(end), 60, t).unwrap();
        assert!(!trigger.fire_plan(t).is_spent());
        assert!(!trigger.fire_plan(start).is_spent());
        // The end bound is exclusive.
        assert!(trigger.fire_plan(end).is_spent());
    }

    #[test]
    fn test_one_shot_has_no_interval() {
        let plan = TriggerSpec::one_shot(Duration::from_secs(1800)).fire_plan(now());
        assert_eq!(plan.initial_delay, Duration::from_secs(1800));
        assert_eq!(plan.interval, None);
        assert!(!plan.is_spent());
    }

    #[test]
    fn test_serde_round_trip() {
        let trigger = TriggerSpec::Window {
            frequency_seconds: 3600,
            start: now(),
            end: now() + TimeDelta::days(1),
        };
        let json = serde_json::to_string(&trigger).unwrap();
        assert_eq!(serde_json::from_str::<TriggerSpec>(&json).unwrap(), trigger);
    }

    proptest! {
        #[test]
        fn prop_valid_windows_always_build(
            frequency in 1u64..1_000_000,
            start_offset in 0i64..100_000,
            window in 1i64..100_000,
        ) {
            let t = now();
            let start = t + TimeDelta::seconds(start_offset);
            let end = start + TimeDelta::seconds(window);
            let trigger = TriggerSpec::build(Some(start), Some(end), frequency, t).unwrap();
            let plan = trigger.fire_plan(t);
            prop_assert_eq!(plan.interval, Some(Duration::from_secs(frequency)));
            // The window is open at plan time, so at least one fire remains.
            prop_assert!(!plan.is_spent());
        }
    }
}
