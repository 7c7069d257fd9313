//! Execution context shared across the steps of an instance.
//!
//! The runtime [`JobContext`] carries the interrupt flag and the mutable
//! key/value context that units of work read and write. Its persisted form is
//! [`ContextSnapshot`], a defined schema (not a free-form string) stored as a
//! step's `context_data` so recovery can deserialize it safely. A missing or
//! unparsable snapshot degrades to restart-the-step semantics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Persisted resumption token for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Offset of the step that produced this snapshot.
    #[serde(default)]
    pub offset: u32,
    /// Opaque key/value state written by the unit of work.
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl ContextSnapshot {
    /// Parse persisted `context_data`. Corrupt payloads are treated as
    /// absent so recovery falls back to restarting the step.
    pub fn parse(context_data: &str) -> Option<Self> {
        serde_json::from_str(context_data).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Runtime context handed to the unit of work for one step execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    instance_id: String,
    offset: u32,
    recovery: bool,
    interrupt: Arc<AtomicBool>,
    data: HashMap<String, String>,
}

impl JobContext {
    pub fn new(
        instance_id: impl Into<String>,
        offset: u32,
        interrupt: Arc<AtomicBool>,
        recovery: bool,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            offset,
            recovery,
            interrupt,
            data: HashMap::new(),
        }
    }

    /// Rebuild a context from a persisted snapshot, advancing to `offset`.
    pub fn from_snapshot(
        instance_id: impl Into<String>,
        offset: u32,
        snapshot: ContextSnapshot,
        interrupt: Arc<AtomicBool>,
        recovery: bool,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            offset,
            recovery,
            interrupt,
            data: snapshot.data,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// True when this execution resumes persisted state after a restart
    /// rather than starting fresh.
    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    /// Cooperative cancellation check. Units of work must consult this
    /// between phases and terminate their own resources when set.
    pub fn should_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            offset: self.offset,
            data: self.data.clone(),
        }
    }
}
