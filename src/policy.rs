//! Read-only replication policy descriptor.
//!
//! Policies are owned by the policy-management subsystem; the scheduler reads
//! one at schedule time and compiles it into step job definitions plus a
//! trigger. Nothing here is written back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Retry budget for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per step (initial execution included).
    /// Zero disables retries entirely.
    pub attempts: u32,
    /// Delay in seconds before a retried attempt fires. Zero falls back to
    /// the configured default.
    pub delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_seconds: 1800,
        }
    }
}

/// One unit-of-work definition within a policy's ordered chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Human-readable step name (e.g. "export", "transfer", "finalize").
    pub name: String,
    /// Job type resolved against the replication job registry.
    pub job_type: String,
    /// Opaque per-step properties consumed by the unit of work.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            properties: HashMap::new(),
        }
    }
}

/// A recurring, possibly multi-step replication job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Stable identifier assigned by policy management; job keys and instance
    /// ids derive from it.
    pub id: String,
    pub name: String,
    /// Interval between scheduled fires.
    pub frequency_seconds: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Ordered chain of steps executed as one logical instance.
    pub steps: Vec<StepSpec>,
}

impl ReplicationPolicy {
    pub fn new(id: impl Into<String>, frequency_seconds: u64, steps: Vec<StepSpec>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            frequency_seconds,
            start_time: None,
            end_time: None,
            retry: RetryPolicy::default(),
            steps,
        }
    }
}
