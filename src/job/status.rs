use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states for instances and steps.
///
/// `Submitted → Running → {Success, Failed, Killed, Ignored}`, with `Deleted`
/// applied later as a retirement tombstone independent of the terminal
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Records created, engine has not fired yet
    Submitted,
    /// Work is executing (start time persisted)
    Running,
    /// Work reported success
    Success,
    /// Work failed and retries are exhausted or disabled
    Failed,
    /// Explicitly interrupted (delete-job or operator abort)
    Killed,
    /// Overlapping fire rejected by the execution guard
    Ignored,
    /// Instance record retired
    Deleted,
}

impl JobStatus {
    /// Terminal states end a run; the guard entry is released on reaching one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Killed | Self::Ignored | Self::Deleted
        )
    }

    /// States counted as failed when deciding whether a chain advances.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Killed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Submitted
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Killed => write!(f, "KILLED"),
            Self::Ignored => write!(f, "IGNORED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(Self::Submitted),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            "IGNORED" => Ok(Self::Ignored),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}
