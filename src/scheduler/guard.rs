//! In-process execution guard.
//!
//! One entry per policy currently running. The entry is inserted atomically
//! when a run wins the right to execute and removed when the run reaches a
//! terminal state, giving at-most-one concurrent instance per policy even
//! when the engine fires an overlapping or misfired trigger. The guard is a
//! coordination cache only; the persisted records stay authoritative.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State of one in-flight run.
#[derive(Debug, Clone)]
pub struct GuardEntry {
    pub instance_id: String,
    pub interrupt: Arc<AtomicBool>,
}

/// Registry of currently-executing policy instances.
#[derive(Debug, Default)]
pub struct ExecutionGuard {
    running: Mutex<HashMap<String, GuardEntry>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the policy for `instance_id`. On success returns the run's
    /// interrupt flag; on failure returns the instance id already holding
    /// the claim. Check and insert happen under one lock acquisition.
    pub fn try_begin(&self, policy_id: &str, instance_id: &str) -> Result<Arc<AtomicBool>, String> {
        let mut running = self.running.lock();
        if let Some(existing) = running.get(policy_id) {
            return Err(existing.instance_id.clone());
        }
        let interrupt = Arc::new(AtomicBool::new(false));
        running.insert(
            policy_id.to_string(),
            GuardEntry {
                instance_id: instance_id.to_string(),
                interrupt: Arc::clone(&interrupt),
            },
        );
        Ok(interrupt)
    }

    /// Release the policy's claim, returning the entry that held it.
    pub fn finish(&self, policy_id: &str) -> Option<GuardEntry> {
        self.running.lock().remove(policy_id)
    }

    /// Request cooperative interruption of the policy's running instance.
    /// Returns false when nothing is running.
    pub fn request_interrupt(&self, policy_id: &str) -> bool {
        match self.running.lock().get(policy_id) {
            Some(entry) => {
                tracing::info!(
                    policy_id = %policy_id,
                    instance_id = %entry.instance_id,
                    "interrupt requested"
                );
                entry.interrupt.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Instance id currently holding the policy, if any.
    pub fn running_instance(&self, policy_id: &str) -> Option<String> {
        self.running
            .lock()
            .get(policy_id)
            .map(|entry| entry.instance_id.clone())
    }

    pub fn is_running(&self, policy_id: &str) -> bool {
        self.running.lock().contains_key(policy_id)
    }

    pub fn active_count(&self) -> usize {
        self.running.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_rejected_with_running_id() {
        let guard = ExecutionGuard::new();
        guard.try_begin("p1", "p1@1").unwrap();
        assert_eq!(guard.try_begin("p1", "p1@2").err(), Some("p1@1".to_string()));
        assert_eq!(guard.running_instance("p1"), Some("p1@1".to_string()));
    }

    #[test]
    fn test_different_policies_run_in_parallel() {
        let guard = ExecutionGuard::new();
        assert!(guard.try_begin("p1", "p1@1").is_ok());
        assert!(guard.try_begin("p2", "p2@1").is_ok());
        assert_eq!(guard.active_count(), 2);
    }

    #[test]
    fn test_finish_releases_claim() {
        let guard = ExecutionGuard::new();
        guard.try_begin("p1", "p1@1").unwrap();
        let entry = guard.finish("p1").unwrap();
        assert_eq!(entry.instance_id, "p1@1");
        assert!(!guard.is_running("p1"));
        assert!(guard.try_begin("p1", "p1@2").is_ok());
    }

    #[test]
    fn test_interrupt_reaches_run_flag() {
        let guard = ExecutionGuard::new();
        let flag = guard.try_begin("p1", "p1@1").unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        assert!(guard.request_interrupt("p1"));
        assert!(flag.load(Ordering::SeqCst));
        assert!(!guard.request_interrupt("idle"));
    }
}
