//! Restart recovery for instances left `RUNNING` by an unclean shutdown.
//!
//! Runs once during bootstrap, after the engine has restored its durable
//! registrations and before `start()` lets triggers fire. Each instance is
//! recovered independently; one bad record never blocks the rest.

use std::sync::Arc;

use crate::error::Result;
use crate::job::{ContextSnapshot, JobStatus};
use crate::scheduler::engine::SchedulingEngine;
use crate::store::{InstanceRecord, StoreHelper};

/// Outcome counts of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Instances found in `RUNNING` status.
    pub scanned: usize,
    /// Instances re-attached to the engine.
    pub resumed: usize,
    /// Instances finalized `FAILED` (missing step record, unregistered
    /// policy, or a guard already held).
    pub failed: usize,
    /// Instances whose recovery raised an error and were left untouched.
    pub errors: usize,
}

pub struct RecoveryService {
    store: StoreHelper,
    engine: Arc<SchedulingEngine>,
}

impl RecoveryService {
    pub fn new(store: StoreHelper, engine: Arc<SchedulingEngine>) -> Self {
        Self { store, engine }
    }

    /// Find every instance still `RUNNING` and resume each at its persisted
    /// offset.
    pub async fn recover_all(&self) -> Result<RecoverySummary> {
        let running = self.store.find_running_instances().await?;
        let mut summary = RecoverySummary {
            scanned: running.len(),
            ..Default::default()
        };

        for instance in running {
            match self.recover_one(&instance).await {
                Ok(true) => summary.resumed += 1,
                Ok(false) => summary.failed += 1,
                Err(error) => {
                    summary.errors += 1;
                    tracing::error!(
                        instance_id = %instance.instance_id,
                        %error,
                        "instance recovery raised an error"
                    );
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            resumed = summary.resumed,
            failed = summary.failed,
            errors = summary.errors,
            "recovery pass complete"
        );
        Ok(summary)
    }

    async fn recover_one(&self, instance: &InstanceRecord) -> Result<bool> {
        let offset = instance.current_offset;
        let step = match self.store.get_step(&instance.instance_id, offset).await? {
            Some(step) => step,
            None => {
                // Incomplete persisted state; nothing to resume from.
                self.store
                    .finalize_instance(
                        &instance.instance_id,
                        JobStatus::Failed,
                        Some(format!("recovery found no step record at offset {offset}")),
                    )
                    .await?;
                return Ok(false);
            }
        };

        // A corrupt snapshot degrades to restarting the step from scratch.
        let snapshot = step.context_data.as_deref().and_then(ContextSnapshot::parse);

        let resumed = self.engine.recover_instance(
            &instance.policy_id,
            offset,
            &instance.instance_id,
            snapshot,
        );
        if !resumed {
            self.store
                .finalize_instance(
                    &instance.instance_id,
                    JobStatus::Failed,
                    Some("recovery could not re-attach the instance".to_string()),
                )
                .await?;
        }
        Ok(resumed)
    }
}
