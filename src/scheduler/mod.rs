//! The scheduling and job-lifecycle orchestration core.
//!
//! [`ReplicationScheduler`] is the process-wide facade: it wires the
//! execution guard, job registry, retry engine, runner, scheduling engine,
//! and recovery service over one store, and owns the bootstrap order
//! (restore registrations, recover `RUNNING` instances, then start firing).

pub mod chain;
pub mod engine;
pub mod guard;
pub mod recovery;
pub mod retry;
pub mod runner;
pub mod trigger;

pub use chain::ChainCoordinator;
pub use engine::{JobKey, ScheduledPolicy, SchedulingEngine};
pub use guard::ExecutionGuard;
pub use recovery::{RecoveryService, RecoverySummary};
pub use retry::{RetryDecision, RetryEngine};
pub use runner::JobRunner;
pub use trigger::{FirePlan, TriggerError, TriggerSpec};

use std::sync::Arc;

use crate::config::ReplicoreConfig;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::job::{ContextSnapshot, JobRegistry};
use crate::policy::ReplicationPolicy;
use crate::store::{InstanceStore, StoreHelper};

/// Operator-facing scheduler service.
pub struct ReplicationScheduler {
    engine: Arc<SchedulingEngine>,
    recovery: RecoveryService,
    registry: Arc<JobRegistry>,
    store: StoreHelper,
}

impl ReplicationScheduler {
    pub fn new(store: Arc<dyn InstanceStore>, config: &ReplicoreConfig) -> Self {
        let events = EventPublisher::new(config.events.capacity);
        let store = StoreHelper::new(store, events, config.scheduler.message_cap);
        let guard = Arc::new(ExecutionGuard::new());
        let registry = Arc::new(JobRegistry::new());
        let retry = RetryEngine::new(config.scheduler.retry_delay());
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            guard,
            Arc::clone(&registry),
            retry,
        ));
        let engine = Arc::new(SchedulingEngine::new(
            runner,
            store.clone(),
            config.scheduler.misfire_threshold(),
        ));
        let recovery = RecoveryService::new(store.clone(), Arc::clone(&engine));
        Self {
            engine,
            recovery,
            registry,
            store,
        }
    }

    /// Register replication job factories here before starting.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventPublisher {
        self.store.events()
    }

    pub fn store(&self) -> &StoreHelper {
        &self.store
    }

    /// Full bootstrap: restore durable registrations, recover instances left
    /// `RUNNING` by an unclean shutdown, then start firing triggers.
    /// Recovery completes its scan before any new trigger can fire.
    pub async fn start(&self) -> Result<RecoverySummary> {
        self.engine.initialize().await?;
        let summary = self.recovery.recover_all().await?;
        self.engine.start();
        Ok(summary)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn is_started(&self) -> bool {
        self.engine.is_started()
    }

    /// Schedule a policy's chained step jobs; returns one key per step.
    pub async fn schedule_policy(&self, policy: &ReplicationPolicy) -> Result<Vec<JobKey>> {
        self.engine.schedule(policy).await
    }

    pub fn suspend_policy(&self, policy_id: &str) -> Result<()> {
        self.engine.suspend_job(policy_id)
    }

    pub fn resume_policy(&self, policy_id: &str) -> Result<()> {
        self.engine.resume_job(policy_id)
    }

    /// Delete a policy: interrupt any running instance, then remove its jobs
    /// and durable registration.
    pub async fn delete_policy(&self, policy_id: &str) -> Result<()> {
        self.engine.delete_job(policy_id).await
    }

    /// Interrupt the policy's currently running instance without touching
    /// its registration. Returns false when nothing is running.
    pub fn abort_instance(&self, policy_id: &str) -> bool {
        self.engine.abort_instance(policy_id)
    }

    /// Re-attach one persisted instance at the given step offset, loading its
    /// persisted context snapshot. Returns false when the instance cannot be
    /// resumed (unknown policy, no step record, or a run already in flight).
    pub async fn recover_instance(
        &self,
        policy_id: &str,
        offset: u32,
        instance_id: &str,
    ) -> Result<bool> {
        let snapshot: Option<ContextSnapshot> = match self.store.get_step(instance_id, offset).await? {
            Some(step) => step.context_data.as_deref().and_then(ContextSnapshot::parse),
            None => return Ok(false),
        };
        Ok(self
            .engine
            .recover_instance(policy_id, offset, instance_id, snapshot))
    }

    /// Soft-delete a retired instance record.
    pub async fn retire_instance(&self, instance_id: &str) -> Result<bool> {
        self.store.retire_instance(instance_id).await
    }

    /// Housekeeping: permanently remove instances retired before the cutoff.
    pub async fn purge_retired(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        self.store.purge_retired(older_than).await
    }
}
