//! In-memory store backend.
//!
//! Backs tests and embedded runs with the same conditional-update semantics
//! as the Postgres store. State does not survive the process; production
//! deployments use [`super::PgInstanceStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::{Result, SchedulerError};
use crate::job::JobStatus;
use crate::store::{InstanceRecord, InstanceStore, RegistrationRecord, StepRecord};

#[derive(Default)]
struct Inner {
    instances: HashMap<String, InstanceRecord>,
    // keyed by (instance_id, offset)
    steps: HashMap<(String, u32), StepRecord>,
    registrations: HashMap<String, RegistrationRecord>,
    run_counters: HashMap<String, i64>,
}

/// Process-local [`InstanceStore`] implementation.
#[derive(Default)]
pub struct MemoryInstanceStore {
    inner: Mutex<Inner>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an instance directly; test setup for recovery scenarios.
    pub fn seed_instance(&self, record: InstanceRecord) {
        let mut inner = self.inner.lock();
        inner
            .instances
            .insert(record.instance_id.clone(), record);
    }

    /// Seed a step directly; test setup for recovery scenarios.
    pub fn seed_step(&self, record: StepRecord) {
        let mut inner = self.inner.lock();
        inner
            .steps
            .insert((record.instance_id.clone(), record.offset), record);
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert_instance(&self, record: InstanceRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.instances.contains_key(&record.instance_id) {
            return Err(SchedulerError::Store(format!(
                "instance already exists: {}",
                record.instance_id
            )));
        }
        inner.instances.insert(record.instance_id.clone(), record);
        Ok(())
    }

    async fn insert_steps(&self, steps: Vec<StepRecord>) -> Result<()> {
        let mut inner = self.inner.lock();
        for step in steps {
            inner
                .steps
                .insert((step.instance_id.clone(), step.offset), step);
        }
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.inner.lock().instances.get(instance_id).cloned())
    }

    async fn get_step(&self, instance_id: &str, offset: u32) -> Result<Option<StepRecord>> {
        Ok(self
            .inner
            .lock()
            .steps
            .get(&(instance_id.to_string(), offset))
            .cloned())
    }

    async fn mark_instance_running(
        &self,
        instance_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.instances.get_mut(instance_id) {
            Some(instance) if instance.status == JobStatus::Submitted => {
                instance.status = JobStatus::Running;
                instance.start_time = Some(start_time);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SchedulerError::Store(format!(
                "no such instance: {instance_id}"
            ))),
        }
    }

    async fn update_instance_offset(&self, instance_id: &str, offset: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.current_offset = offset;
                Ok(())
            }
            None => Err(SchedulerError::Store(format!(
                "no such instance: {instance_id}"
            ))),
        }
    }

    async fn complete_instance(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.instances.get_mut(instance_id) {
            Some(instance) if !instance.status.is_terminal() => {
                instance.status = status;
                instance.end_time = Some(end_time);
                instance.message = message;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SchedulerError::Store(format!(
                "no such instance: {instance_id}"
            ))),
        }
    }

    async fn mark_step_running(
        &self,
        instance_id: &str,
        offset: u32,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.steps.get_mut(&(instance_id.to_string(), offset)) {
            Some(step) if !step.status.is_terminal() => {
                step.status = JobStatus::Running;
                step.start_time = Some(start_time);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SchedulerError::Store(format!(
                "no such step: {instance_id}/{offset}"
            ))),
        }
    }

    async fn set_step_message(
        &self,
        instance_id: &str,
        offset: u32,
        message: String,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.steps.get_mut(&(instance_id.to_string(), offset)) {
            Some(step) => {
                step.message = Some(message);
                Ok(())
            }
            None => Err(SchedulerError::Store(format!(
                "no such step: {instance_id}/{offset}"
            ))),
        }
    }

    async fn complete_step(
        &self,
        instance_id: &str,
        offset: u32,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
        context_data: Option<String>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.steps.get_mut(&(instance_id.to_string(), offset)) {
            Some(step) if !step.status.is_terminal() => {
                step.status = status;
                step.end_time = Some(end_time);
                if message.is_some() {
                    step.message = message;
                }
                if context_data.is_some() {
                    step.context_data = context_data;
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SchedulerError::Store(format!(
                "no such step: {instance_id}/{offset}"
            ))),
        }
    }

    async fn mark_remaining_steps(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for ((id, _), step) in inner.steps.iter_mut() {
            if id == instance_id && step.status == JobStatus::Submitted {
                step.status = status;
                step.end_time = Some(end_time);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn increment_step_run_count(&self, instance_id: &str, offset: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        match inner.steps.get_mut(&(instance_id.to_string(), offset)) {
            Some(step) => {
                step.run_count += 1;
                Ok(step.run_count)
            }
            None => Err(SchedulerError::Store(format!(
                "no such step: {instance_id}/{offset}"
            ))),
        }
    }

    async fn find_instances_by_status(&self, status: JobStatus) -> Result<Vec<InstanceRecord>> {
        let inner = self.inner.lock();
        let mut found: Vec<InstanceRecord> = inner
            .instances
            .values()
            .filter(|instance| instance.status == status && instance.deletion_time.is_none())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(found)
    }

    async fn retire_instance(
        &self,
        instance_id: &str,
        deletion_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let retired = match inner.instances.get_mut(instance_id) {
            Some(instance) if instance.deletion_time.is_none() => {
                instance.status = JobStatus::Deleted;
                instance.deletion_time = Some(deletion_time);
                true
            }
            _ => false,
        };
        if retired {
            for ((id, _), step) in inner.steps.iter_mut() {
                if id == instance_id {
                    step.deletion_time = Some(deletion_time);
                }
            }
        }
        Ok(retired)
    }

    async fn purge_retired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .instances
            .values()
            .filter(|instance| matches!(instance.deletion_time, Some(t) if t < older_than))
            .map(|instance| instance.instance_id.clone())
            .collect();
        for id in &doomed {
            inner.instances.remove(id);
            inner.steps.retain(|(step_id, _), _| step_id != id);
        }
        Ok(doomed.len() as u64)
    }

    async fn save_registration(&self, policy_id: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.registrations.insert(
            policy_id.to_string(),
            RegistrationRecord {
                policy_id: policy_id.to_string(),
                payload: payload.to_string(),
            },
        );
        inner.run_counters.entry(policy_id.to_string()).or_insert(0);
        Ok(())
    }

    async fn delete_registration(&self, policy_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.run_counters.remove(policy_id);
        Ok(inner.registrations.remove(policy_id).is_some())
    }

    async fn load_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<RegistrationRecord> = inner.registrations.values().cloned().collect();
        records.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
        Ok(records)
    }

    async fn next_run_count(&self, policy_id: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        if !inner.registrations.contains_key(policy_id) {
            return Err(SchedulerError::Store(format!(
                "policy is not registered: {policy_id}"
            )));
        }
        let counter = inner.run_counters.entry(policy_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_instance_completion() {
        let store = MemoryInstanceStore::new();
        store
            .insert_instance(InstanceRecord::new("p1@1", "p1"))
            .await
            .unwrap();
        assert!(store
            .mark_instance_running("p1@1", Utc::now())
            .await
            .unwrap());

        // first terminal write wins
        assert!(store
            .complete_instance("p1@1", JobStatus::Failed, Utc::now(), None)
            .await
            .unwrap());
        assert!(!store
            .complete_instance("p1@1", JobStatus::Killed, Utc::now(), None)
            .await
            .unwrap());
        let instance = store.get_instance("p1@1").await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_remaining_steps_bulk_transition() {
        let store = MemoryInstanceStore::new();
        store
            .insert_steps(vec![
                StepRecord::new("p1@1", 0),
                StepRecord::new("p1@1", 1),
                StepRecord::new("p1@1", 2),
            ])
            .await
            .unwrap();
        store.mark_step_running("p1@1", 0, Utc::now()).await.unwrap();
        store
            .complete_step("p1@1", 0, JobStatus::Failed, Utc::now(), None, None)
            .await
            .unwrap();

        let changed = store
            .mark_remaining_steps("p1@1", JobStatus::Killed, Utc::now())
            .await
            .unwrap();
        assert_eq!(changed, 2);
        let step0 = store.get_step("p1@1", 0).await.unwrap().unwrap();
        assert_eq!(step0.status, JobStatus::Failed);
        let step2 = store.get_step("p1@1", 2).await.unwrap().unwrap();
        assert_eq!(step2.status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn test_run_counter_is_monotonic_per_policy() {
        let store = MemoryInstanceStore::new();
        store.save_registration("p1", "{}").await.unwrap();
        store.save_registration("p2", "{}").await.unwrap();
        assert_eq!(store.next_run_count("p1").await.unwrap(), 1);
        assert_eq!(store.next_run_count("p1").await.unwrap(), 2);
        assert_eq!(store.next_run_count("p2").await.unwrap(), 1);
        // re-saving a registration preserves the counter
        store.save_registration("p1", "{}").await.unwrap();
        assert_eq!(store.next_run_count("p1").await.unwrap(), 3);
        assert!(store.next_run_count("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_retire_and_purge() {
        let store = MemoryInstanceStore::new();
        store
            .insert_instance(InstanceRecord::new("p1@1", "p1"))
            .await
            .unwrap();
        store
            .insert_steps(vec![StepRecord::new("p1@1", 0)])
            .await
            .unwrap();

        let cutoff = Utc::now();
        assert!(store
            .retire_instance("p1@1", cutoff - chrono::Duration::days(30))
            .await
            .unwrap());
        assert!(!store.retire_instance("p1@1", cutoff).await.unwrap());

        let purged = store.purge_retired(cutoff).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_instance("p1@1").await.unwrap().is_none());
        assert!(store.get_step("p1@1", 0).await.unwrap().is_none());
    }
}
