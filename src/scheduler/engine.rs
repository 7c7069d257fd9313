//! Scheduling engine: job registration, trigger loops, and control
//! operations.
//!
//! The engine is an explicitly constructed service object. `initialize()`
//! restores durable job registrations (recovery runs against this state,
//! before any trigger fires); `start()` spawns one trigger loop per
//! registered policy; `stop()` halts the loops. Control operations on an
//! unknown policy surface [`SchedulerError::JobNotFound`], and scheduling
//! before `start()` surfaces [`SchedulerError::NotStarted`].

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, SchedulerError};
use crate::job::{ContextSnapshot, JobStatus};
use crate::policy::{ReplicationPolicy, RetryPolicy, StepSpec};
use crate::scheduler::runner::JobRunner;
use crate::scheduler::trigger::TriggerSpec;
use crate::store::StoreHelper;

/// Identity of one registered step job, `policy_id/offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub policy_id: String,
    pub offset: u32,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy_id, self.offset)
    }
}

/// A policy compiled for scheduling: its ordered step jobs, trigger, and
/// retry budget. This is the durable registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPolicy {
    pub policy_id: String,
    pub steps: Vec<StepSpec>,
    pub trigger: TriggerSpec,
    pub retry: RetryPolicy,
}

impl ScheduledPolicy {
    /// Compile a policy descriptor, validating its schedule window.
    pub fn compile(policy: &ReplicationPolicy) -> Result<Self> {
        let trigger = TriggerSpec::build(
            policy.start_time,
            policy.end_time,
            policy.frequency_seconds,
            Utc::now(),
        )?;
        Ok(Self {
            policy_id: policy.id.clone(),
            steps: policy.steps.clone(),
            trigger,
            retry: policy.retry,
        })
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        (0..self.steps.len() as u32)
            .map(|offset| JobKey {
                policy_id: self.policy_id.clone(),
                offset,
            })
            .collect()
    }
}

struct JobEntry {
    policy: Arc<ScheduledPolicy>,
    suspend: watch::Sender<bool>,
    loop_handle: Option<JoinHandle<()>>,
}

/// The single per-process scheduling engine.
pub struct SchedulingEngine {
    runner: Arc<JobRunner>,
    store: StoreHelper,
    jobs: DashMap<String, JobEntry>,
    misfire_threshold: Duration,
    initialized: AtomicBool,
    started: AtomicBool,
}

impl SchedulingEngine {
    pub fn new(runner: Arc<JobRunner>, store: StoreHelper, misfire_threshold: Duration) -> Self {
        Self {
            runner,
            store,
            jobs: DashMap::new(),
            misfire_threshold,
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Restore durable registrations without starting trigger loops. The
    /// recovery pass runs against this state so a recovered instance resumes
    /// before its policy can fire again.
    pub async fn initialize(&self) -> Result<()> {
        let registrations = self.store.load_registrations().await?;
        for registration in registrations {
            match serde_json::from_str::<ScheduledPolicy>(&registration.payload) {
                Ok(policy) => {
                    let (suspend, _) = watch::channel(false);
                    self.jobs.insert(
                        registration.policy_id.clone(),
                        JobEntry {
                            policy: Arc::new(policy),
                            suspend,
                            loop_handle: None,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        policy_id = %registration.policy_id,
                        %error,
                        "skipping corrupt job registration"
                    );
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(jobs = self.jobs.len(), "scheduling engine initialized");
        Ok(())
    }

    /// Begin firing triggers for every registered policy.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for mut entry in self.jobs.iter_mut() {
            if entry.loop_handle.is_none() {
                let handle = self.spawn_trigger_loop(&entry);
                entry.loop_handle = Some(handle);
            }
        }
        tracing::info!("scheduling engine started");
    }

    /// Halt trigger loops. In-flight runs finish on their own.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for mut entry in self.jobs.iter_mut() {
            if let Some(handle) = entry.loop_handle.take() {
                handle.abort();
            }
        }
        tracing::info!("scheduling engine stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register a policy's step jobs and trigger. The registration is made
    /// durable before the first fire so the job survives a restart.
    pub async fn schedule(&self, policy: &ReplicationPolicy) -> Result<Vec<JobKey>> {
        if !self.is_started() {
            return Err(SchedulerError::NotStarted);
        }
        let scheduled = Arc::new(ScheduledPolicy::compile(policy)?);
        let payload = serde_json::to_string(scheduled.as_ref())?;
        self.store.save_registration(&scheduled.policy_id, &payload).await?;

        let keys = scheduled.job_keys();
        let (suspend, _) = watch::channel(false);
        let mut entry = JobEntry {
            policy: Arc::clone(&scheduled),
            suspend,
            loop_handle: None,
        };
        entry.loop_handle = Some(self.spawn_trigger_loop(&entry));
        if let Some(previous) = self.jobs.insert(scheduled.policy_id.clone(), entry) {
            if let Some(handle) = previous.loop_handle {
                handle.abort();
            }
        }
        tracing::info!(policy_id = %scheduled.policy_id, steps = keys.len(), "policy scheduled");
        Ok(keys)
    }

    /// Pause firing without forgetting the registration. A fire that comes
    /// due while suspended is dropped, not queued; the next fire happens on
    /// resume (misfire semantics) or at the next tick.
    pub fn suspend_job(&self, policy_id: &str) -> Result<()> {
        let entry = self
            .jobs
            .get(policy_id)
            .ok_or_else(|| SchedulerError::JobNotFound(policy_id.to_string()))?;
        let _ = entry.suspend.send(true);
        tracing::info!(policy_id = %policy_id, "job suspended");
        Ok(())
    }

    pub fn resume_job(&self, policy_id: &str) -> Result<()> {
        let entry = self
            .jobs
            .get(policy_id)
            .ok_or_else(|| SchedulerError::JobNotFound(policy_id.to_string()))?;
        let _ = entry.suspend.send(false);
        tracing::info!(policy_id = %policy_id, "job resumed");
        Ok(())
    }

    /// Remove a policy's jobs. Any currently executing instance is
    /// interrupted and finalized `KILLED` first, then the durable
    /// registration is deleted.
    pub async fn delete_job(&self, policy_id: &str) -> Result<()> {
        let (_, entry) = self
            .jobs
            .remove(policy_id)
            .ok_or_else(|| SchedulerError::JobNotFound(policy_id.to_string()))?;
        if let Some(handle) = entry.loop_handle {
            handle.abort();
        }

        let guard = self.runner.guard();
        if let Some(instance_id) = guard.running_instance(policy_id) {
            guard.request_interrupt(policy_id);
            // Finalize durably now; the interrupted run's later writes no-op
            // against the terminal row.
            self.store.kill_remaining_steps(&instance_id).await?;
            self.store
                .finalize_instance(&instance_id, JobStatus::Killed, Some("policy deleted".to_string()))
                .await?;
        }

        self.store.delete_registration(policy_id).await?;
        tracing::info!(policy_id = %policy_id, "policy deleted");
        Ok(())
    }

    /// Interrupt the policy's running instance, if any.
    pub fn abort_instance(&self, policy_id: &str) -> bool {
        self.runner.guard().request_interrupt(policy_id)
    }

    /// Re-attach a recovered instance: claim the guard for it and resume its
    /// chain at `offset`. Returns false when the policy is no longer
    /// registered or another run already holds the guard.
    pub fn recover_instance(
        &self,
        policy_id: &str,
        offset: u32,
        instance_id: &str,
        snapshot: Option<ContextSnapshot>,
    ) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let policy = match self.jobs.get(policy_id) {
            Some(entry) => Arc::clone(&entry.policy),
            None => {
                tracing::warn!(
                    policy_id = %policy_id,
                    instance_id = %instance_id,
                    "cannot recover, policy is not registered"
                );
                return false;
            }
        };
        let interrupt = match self.runner.guard().try_begin(policy_id, instance_id) {
            Ok(flag) => flag,
            Err(running_id) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    running_id = %running_id,
                    "cannot recover, another instance is running"
                );
                return false;
            }
        };
        if offset as usize >= policy.steps.len() {
            tracing::warn!(
                instance_id = %instance_id,
                offset,
                "cannot recover, offset is beyond the policy's chain"
            );
            self.runner.guard().finish(policy_id);
            return false;
        }

        let runner = Arc::clone(&self.runner);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = runner
                .run_recovery(&policy, &instance_id, offset, snapshot, interrupt)
                .await
            {
                tracing::error!(instance_id = %instance_id, %error, "recovered run failed");
            }
        });
        true
    }

    fn spawn_trigger_loop(&self, entry: &JobEntry) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        let policy = Arc::clone(&entry.policy);
        let suspend = entry.suspend.subscribe();
        let misfire_threshold = self.misfire_threshold;
        tokio::spawn(trigger_loop(runner, policy, suspend, misfire_threshold))
    }
}

/// Drives one policy's trigger: sleep to the next fire time, wait out
/// suspension, apply misfire semantics (fire now once, drop missed ticks),
/// and spawn the run.
async fn trigger_loop(
    runner: Arc<JobRunner>,
    policy: Arc<ScheduledPolicy>,
    mut suspend: watch::Receiver<bool>,
    misfire_threshold: Duration,
) {
    let plan = policy.trigger.fire_plan(Utc::now());
    if plan.is_spent() {
        tracing::warn!(policy_id = %policy.policy_id, "trigger window already closed");
        return;
    }
    let started_at = Instant::now();
    let expiry = plan.expires_after.map(|after| started_at + after);
    let mut next = started_at + plan.initial_delay;

    loop {
        if let Some(expiry) = expiry {
            if next >= expiry {
                tracing::info!(policy_id = %policy.policy_id, "trigger expired");
                return;
            }
        }
        tokio::time::sleep_until(next).await;

        while *suspend.borrow() {
            if suspend.changed().await.is_err() {
                return;
            }
        }

        // Late past the threshold (engine down or job suspended through the
        // tick): fire once now and realign.
        let now = Instant::now();
        if now > next + misfire_threshold {
            next = now;
        }
        // The suspension or the delay may have outlasted the trigger window.
        if let Some(expiry) = expiry {
            if next >= expiry {
                tracing::info!(policy_id = %policy.policy_id, "trigger expired");
                return;
            }
        }

        let fire_runner = Arc::clone(&runner);
        let fire_policy = Arc::clone(&policy);
        tokio::spawn(async move {
            if let Err(error) = fire_runner.run_scheduled(&fire_policy).await {
                tracing::error!(
                    policy_id = %fire_policy.policy_id,
                    %error,
                    "fired run failed"
                );
            }
        });

        match plan.interval {
            Some(interval) => next += interval,
            None => return,
        }
    }
}
