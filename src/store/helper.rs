//! High-level persistence operations for the scheduler.
//!
//! [`StoreHelper`] wraps the backend store with the scheduler's domain
//! conventions: instance ids of the form `policyId@runCount`, contiguous step
//! rows created up front, message truncation before durable writes, and
//! terminal events emitted exactly once per instance (keyed off whether the
//! conditional update actually changed the row).

use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::events::{EventPublisher, InstanceEvent, InstanceEventKind};
use crate::job::{ContextSnapshot, JobStatus};
use crate::store::{InstanceRecord, InstanceStore, RegistrationRecord, StepRecord};

const TRUNCATION_SUFFIX: &str = " ...";

/// Message recorded on steps abandoned because an earlier instance of the
/// same policy was still running.
pub const PARALLEL_INSTANCE_MESSAGE: &str = "ignored, another instance of the policy is running";

/// Domain-level facade over the instance store.
#[derive(Clone)]
pub struct StoreHelper {
    store: Arc<dyn InstanceStore>,
    events: EventPublisher,
    message_cap: usize,
}

impl StoreHelper {
    pub fn new(store: Arc<dyn InstanceStore>, events: EventPublisher, message_cap: usize) -> Self {
        Self {
            store,
            events,
            message_cap,
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Derive the owning policy id from an instance id.
    pub fn policy_of(instance_id: &str) -> &str {
        match instance_id.rsplit_once('@') {
            Some((policy_id, _)) => policy_id,
            None => instance_id,
        }
    }

    /// Cap a message before the durable write.
    fn truncate(&self, message: String) -> String {
        if message.len() <= self.message_cap {
            return message;
        }
        let keep = self.message_cap.saturating_sub(TRUNCATION_SUFFIX.len());
        let mut end = keep;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{}", &message[..end], TRUNCATION_SUFFIX)
    }

    /// Allocate the next instance of a policy: advance the durable run
    /// counter, insert the instance row, and insert one `SUBMITTED` step row
    /// per chain position so every follow-up update targets an existing row.
    pub async fn new_instance(&self, policy_id: &str, step_count: usize) -> Result<String> {
        let run_count = self.store.next_run_count(policy_id).await?;
        let instance_id = format!("{policy_id}@{run_count}");
        self.store
            .insert_instance(InstanceRecord::new(&instance_id, policy_id))
            .await?;
        let steps = (0..step_count as u32)
            .map(|offset| StepRecord::new(&instance_id, offset))
            .collect();
        self.store.insert_steps(steps).await?;
        tracing::debug!(instance_id = %instance_id, steps = step_count, "instance allocated");
        Ok(instance_id)
    }

    pub async fn begin_instance(&self, instance_id: &str) -> Result<bool> {
        self.store
            .mark_instance_running(instance_id, Utc::now())
            .await
    }

    pub async fn begin_step(&self, instance_id: &str, offset: u32) -> Result<bool> {
        self.store
            .mark_step_running(instance_id, offset, Utc::now())
            .await
    }

    /// Record that an attempt of the step is starting; returns the attempt
    /// number (1-based). Incrementing at attempt start keeps the count honest
    /// across crashes between scheduling a retry and executing it.
    pub async fn step_attempt_started(&self, instance_id: &str, offset: u32) -> Result<u32> {
        self.store.increment_step_run_count(instance_id, offset).await
    }

    /// Note a pending retry on the step without leaving the `RUNNING` status,
    /// so the instance stays resumable while the delay elapses.
    pub async fn step_retry_pending(
        &self,
        instance_id: &str,
        offset: u32,
        message: String,
    ) -> Result<()> {
        let message = self.truncate(message);
        self.store
            .set_step_message(instance_id, offset, message)
            .await
    }

    /// Terminal transition of a step, persisting the context snapshot when
    /// one was produced.
    pub async fn complete_step(
        &self,
        instance_id: &str,
        offset: u32,
        status: JobStatus,
        message: Option<String>,
        snapshot: Option<&ContextSnapshot>,
    ) -> Result<bool> {
        let message = message.map(|m| self.truncate(m));
        let context_data = snapshot.map(ContextSnapshot::to_json);
        self.store
            .complete_step(instance_id, offset, status, Utc::now(), message, context_data)
            .await
    }

    /// Bulk-`KILLED` every step of the instance that never started.
    pub async fn kill_remaining_steps(&self, instance_id: &str) -> Result<u64> {
        self.store
            .mark_remaining_steps(instance_id, JobStatus::Killed, Utc::now())
            .await
    }

    pub async fn update_offset(&self, instance_id: &str, offset: u32) -> Result<()> {
        self.store.update_instance_offset(instance_id, offset).await
    }

    /// Terminal transition of an instance. The event fires only when this
    /// call is the one that changed the row, so concurrent finalizers
    /// (a failing step and a kill racing it) emit exactly one event.
    pub async fn finalize_instance(
        &self,
        instance_id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<bool> {
        let message = message.map(|m| self.truncate(m));
        let changed = self
            .store
            .complete_instance(instance_id, status, Utc::now(), message.clone())
            .await?;
        if changed {
            tracing::info!(instance_id = %instance_id, status = %status, "instance finalized");
            if let Some(kind) = InstanceEventKind::from_status(status) {
                self.events.publish(InstanceEvent {
                    kind,
                    instance_id: instance_id.to_string(),
                    policy_id: Self::policy_of(instance_id).to_string(),
                    message,
                    occurred_at: Utc::now(),
                });
            }
        }
        Ok(changed)
    }

    /// Abandon an instance that lost the per-policy execution race: every
    /// step and the instance itself become `IGNORED`.
    pub async fn ignore_instance(&self, instance_id: &str, running_id: &str) -> Result<()> {
        let message = format!("{PARALLEL_INSTANCE_MESSAGE}: {running_id}");
        self.store
            .mark_remaining_steps(instance_id, JobStatus::Ignored, Utc::now())
            .await?;
        self.finalize_instance(instance_id, JobStatus::Ignored, Some(message))
            .await?;
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.store.get_instance(instance_id).await
    }

    pub async fn get_step(&self, instance_id: &str, offset: u32) -> Result<Option<StepRecord>> {
        self.store.get_step(instance_id, offset).await
    }

    pub async fn find_running_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.store.find_instances_by_status(JobStatus::Running).await
    }

    /// Soft-delete an instance; emits a `DELETED` event when this call did
    /// the retiring.
    pub async fn retire_instance(&self, instance_id: &str) -> Result<bool> {
        let retired = self.store.retire_instance(instance_id, Utc::now()).await?;
        if retired {
            self.events.publish(InstanceEvent {
                kind: InstanceEventKind::Deleted,
                instance_id: instance_id.to_string(),
                policy_id: Self::policy_of(instance_id).to_string(),
                message: None,
                occurred_at: Utc::now(),
            });
        }
        Ok(retired)
    }

    pub async fn purge_retired(&self, older_than: chrono::DateTime<Utc>) -> Result<u64> {
        self.store.purge_retired(older_than).await
    }

    pub async fn save_registration(&self, policy_id: &str, payload: &str) -> Result<()> {
        self.store.save_registration(policy_id, payload).await
    }

    pub async fn delete_registration(&self, policy_id: &str) -> Result<bool> {
        self.store.delete_registration(policy_id).await
    }

    pub async fn load_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        self.store.load_registrations().await
    }
}
