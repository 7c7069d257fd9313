use crate::scheduler::trigger::TriggerError;

/// Errors surfaced by the scheduling core.
///
/// Scheduling-engine errors (unknown key, engine not running) are surfaced to
/// the caller and never retried automatically. Persistence errors are fatal to
/// the transition that attempted the write, since the in-memory and persisted
/// states must not diverge silently.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduling engine is not running")]
    NotStarted,

    #[error("no scheduled job found for policy: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("no replication job registered for type: {0}")]
    UnknownJobType(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Store(err.to_string())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
