//! Configuration for the replication scheduling core.
//!
//! Values come from an optional `replicore` config file (TOML/YAML) layered
//! with `REPLICORE_`-prefixed environment variables. Defaults match the
//! documented scheduler behavior: three retry attempts, 1800 second retry
//! delay, 4000 character message cap.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicoreConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub events: EventConfig,
}

/// Scheduling engine and retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How late a fire may run before it is treated as a misfire.
    #[serde(default = "default_misfire_threshold_seconds")]
    pub misfire_threshold_seconds: u64,
    /// Retry attempt budget used when a policy does not carry its own.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Retry delay used when a policy configures none (or zero).
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    /// Upper bound on persisted status messages; longer text is truncated
    /// before the durable write.
    #[serde(default = "default_message_cap")]
    pub message_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Capacity of the domain-event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_misfire_threshold_seconds() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    1800
}

fn default_message_cap() -> usize {
    4000
}

fn default_database_url() -> String {
    "postgres://localhost/replicore".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_threshold_seconds: default_misfire_threshold_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay_seconds(),
            message_cap: default_message_cap(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool: default_pool_size(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_secs(self.misfire_threshold_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl ReplicoreConfig {
    /// Load configuration from `replicore.{toml,yaml,json}` (optional) merged
    /// with `REPLICORE_`-prefixed environment variables
    /// (e.g. `REPLICORE_SCHEDULER__RETRY_ATTEMPTS=5`).
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("replicore").required(false))
            .add_source(config::Environment::with_prefix("REPLICORE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
