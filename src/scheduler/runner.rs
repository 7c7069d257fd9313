//! Fire execution: the code path that runs when a trigger fires.
//!
//! One call to [`JobRunner::run_scheduled`] owns a whole logical run: it
//! allocates the instance, claims the execution guard, walks the step chain,
//! applies retry decisions, and drives every durable transition through the
//! store helper. Recovery re-enters the same chain walk at the persisted
//! offset via [`JobRunner::run_recovery`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::job::{ContextSnapshot, JobContext, JobRegistry, JobStatus, ReplicationError, ReplicationJob};
use crate::policy::StepSpec;
use crate::scheduler::chain::ChainCoordinator;
use crate::scheduler::engine::ScheduledPolicy;
use crate::scheduler::guard::ExecutionGuard;
use crate::scheduler::retry::{RetryDecision, RetryEngine};
use crate::scheduler::trigger::TriggerSpec;
use crate::store::StoreHelper;

/// Result of one step after its attempt budget has been applied.
enum StepOutcome {
    Success(ContextSnapshot),
    Failed(String),
    Killed,
}

/// Executes fired jobs against the persisted state machine.
pub struct JobRunner {
    store: StoreHelper,
    guard: Arc<ExecutionGuard>,
    registry: Arc<JobRegistry>,
    retry: RetryEngine,
}

impl JobRunner {
    pub fn new(
        store: StoreHelper,
        guard: Arc<ExecutionGuard>,
        registry: Arc<JobRegistry>,
        retry: RetryEngine,
    ) -> Self {
        Self {
            store,
            guard,
            registry,
            retry,
        }
    }

    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    pub fn store(&self) -> &StoreHelper {
        &self.store
    }

    /// A regular trigger fire: allocate the next instance of the policy and
    /// run its chain from offset zero. An overlapping fire loses the guard
    /// race and is recorded `IGNORED` without touching the in-flight run.
    pub async fn run_scheduled(&self, policy: &ScheduledPolicy) -> Result<()> {
        let instance_id = self
            .store
            .new_instance(&policy.policy_id, policy.steps.len())
            .await?;

        let interrupt = match self.guard.try_begin(&policy.policy_id, &instance_id) {
            Ok(flag) => flag,
            Err(running_id) => {
                tracing::warn!(
                    policy_id = %policy.policy_id,
                    instance_id = %instance_id,
                    running_id = %running_id,
                    "overlapping fire ignored"
                );
                return self.store.ignore_instance(&instance_id, &running_id).await;
            }
        };

        let result = self.execute_run(policy, &instance_id, 0, None, &interrupt, false).await;
        self.guard.finish(&policy.policy_id);
        result
    }

    /// Resume a recovered instance at its persisted offset. The caller holds
    /// the guard claim for this instance and passes its interrupt flag.
    pub async fn run_recovery(
        &self,
        policy: &ScheduledPolicy,
        instance_id: &str,
        offset: u32,
        snapshot: Option<ContextSnapshot>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<()> {
        tracing::info!(
            instance_id = %instance_id,
            offset,
            resumable = snapshot.is_some(),
            "resuming recovered instance"
        );
        let result = self
            .execute_run(policy, instance_id, offset, snapshot, &interrupt, true)
            .await;
        self.guard.finish(&policy.policy_id);
        result
    }

    async fn execute_run(
        &self,
        policy: &ScheduledPolicy,
        instance_id: &str,
        start_offset: u32,
        snapshot: Option<ContextSnapshot>,
        interrupt: &Arc<AtomicBool>,
        recovery: bool,
    ) -> Result<()> {
        self.store.begin_instance(instance_id).await?;
        self.run_chain(policy, instance_id, start_offset, snapshot, interrupt, recovery)
            .await
    }

    /// Walk the chain from `start_offset` until a terminal instance outcome.
    async fn run_chain(
        &self,
        policy: &ScheduledPolicy,
        instance_id: &str,
        start_offset: u32,
        snapshot: Option<ContextSnapshot>,
        interrupt: &Arc<AtomicBool>,
        recovery: bool,
    ) -> Result<()> {
        let chain = ChainCoordinator::new(policy.steps.len());
        let mut offset = start_offset;
        let mut carried = snapshot;
        let mut recovering = recovery;

        let (status, message) = loop {
            self.store.update_offset(instance_id, offset).await?;
            let spec = &policy.steps[offset as usize];
            let outcome = self
                .run_step(policy, spec, instance_id, offset, carried.take(), interrupt, recovering)
                .await?;
            recovering = false;

            match outcome {
                StepOutcome::Success(snapshot) => match chain.next_offset(offset) {
                    Some(next) => {
                        carried = Some(snapshot);
                        offset = next;
                    }
                    None => break (JobStatus::Success, None),
                },
                StepOutcome::Failed(message) => {
                    chain.abandon_remaining(&self.store, instance_id).await?;
                    break (JobStatus::Failed, Some(message));
                }
                StepOutcome::Killed => {
                    chain.abandon_remaining(&self.store, instance_id).await?;
                    break (JobStatus::Killed, Some("execution interrupted".to_string()));
                }
            }
        };

        self.store.finalize_instance(instance_id, status, message).await?;
        Ok(())
    }

    /// Run one step to a terminal step status, retrying failed attempts per
    /// the policy's budget. The attempt count is incremented when an attempt
    /// starts, so a crash during the retry wait does not consume one.
    async fn run_step(
        &self,
        policy: &ScheduledPolicy,
        spec: &StepSpec,
        instance_id: &str,
        offset: u32,
        snapshot: Option<ContextSnapshot>,
        interrupt: &Arc<AtomicBool>,
        recovery: bool,
    ) -> Result<StepOutcome> {
        let mut snapshot = snapshot;
        loop {
            if interrupt.load(Ordering::SeqCst) {
                return self.kill_step(instance_id, offset).await;
            }

            let attempt = self.store.step_attempt_started(instance_id, offset).await?;
            self.store.begin_step(instance_id, offset).await?;

            let job = match self.registry.resolve(spec) {
                Ok(job) => job,
                Err(SchedulerError::UnknownJobType(job_type)) => {
                    // A configuration fault, not a transient failure.
                    let message = format!("unknown job type: {job_type}");
                    self.store
                        .complete_step(instance_id, offset, JobStatus::Failed, Some(message.clone()), None)
                        .await?;
                    return Ok(StepOutcome::Failed(message));
                }
                Err(other) => return Err(other),
            };

            let mut ctx = match snapshot.take() {
                Some(snapshot) => JobContext::from_snapshot(
                    instance_id,
                    offset,
                    snapshot,
                    Arc::clone(interrupt),
                    recovery,
                ),
                None => JobContext::new(instance_id, offset, Arc::clone(interrupt), recovery),
            };

            tracing::debug!(
                instance_id = %instance_id,
                offset,
                step = %spec.name,
                attempt,
                "executing step"
            );

            match Self::execute_phases(job.as_ref(), &mut ctx).await {
                Ok(()) => {
                    let produced = ctx.snapshot();
                    self.store
                        .complete_step(instance_id, offset, JobStatus::Success, None, Some(&produced))
                        .await?;
                    return Ok(StepOutcome::Success(produced));
                }
                Err(ReplicationError::Interrupted) => {
                    return self.kill_step(instance_id, offset).await;
                }
                Err(error) => {
                    if ctx.should_interrupt() {
                        return self.kill_step(instance_id, offset).await;
                    }
                    match self.retry.decide(&policy.retry, attempt) {
                        RetryDecision::Reschedule { delay } => {
                            let message = format!(
                                "attempt {attempt} failed: {error}; retrying in {}s",
                                delay.as_secs()
                            );
                            tracing::warn!(
                                instance_id = %instance_id,
                                offset,
                                attempt,
                                delay_seconds = delay.as_secs(),
                                "step failed, retry scheduled"
                            );
                            self.store
                                .step_retry_pending(instance_id, offset, message)
                                .await?;
                            let plan = TriggerSpec::one_shot(delay).fire_plan(chrono::Utc::now());
                            tokio::time::sleep(plan.initial_delay).await;
                        }
                        RetryDecision::Exhausted => {
                            let message = format!("attempt {attempt} failed: {error}");
                            tracing::error!(
                                instance_id = %instance_id,
                                offset,
                                attempt,
                                "step failed, retries exhausted"
                            );
                            self.store
                                .complete_step(
                                    instance_id,
                                    offset,
                                    JobStatus::Failed,
                                    Some(message.clone()),
                                    None,
                                )
                                .await?;
                            return Ok(StepOutcome::Failed(message));
                        }
                    }
                }
            }
        }
    }

    async fn kill_step(&self, instance_id: &str, offset: u32) -> Result<StepOutcome> {
        self.store
            .complete_step(
                instance_id,
                offset,
                JobStatus::Killed,
                Some("execution interrupted".to_string()),
                None,
            )
            .await?;
        Ok(StepOutcome::Killed)
    }

    /// The three phases of a unit of work, with cooperative interrupt checks
    /// between them.
    async fn execute_phases(
        job: &dyn ReplicationJob,
        ctx: &mut JobContext,
    ) -> std::result::Result<(), ReplicationError> {
        if ctx.should_interrupt() {
            return Err(ReplicationError::Interrupted);
        }
        job.establish_connection(ctx).await?;
        if ctx.should_interrupt() {
            return Err(ReplicationError::Interrupted);
        }
        job.perform_replication(ctx).await?;
        if ctx.should_interrupt() {
            return Err(ReplicationError::Interrupted);
        }
        job.update_execution_details(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::policy::RetryPolicy;
    use crate::store::{InstanceStore, MemoryInstanceStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    // One entry per attempt, oldest first: Some(error) fails, None succeeds.
    type Script = Vec<Option<String>>;

    struct ScriptedJob {
        step_name: String,
        scripts: Arc<Mutex<std::collections::HashMap<String, Script>>>,
    }

    #[async_trait]
    impl ReplicationJob for ScriptedJob {
        async fn establish_connection(
            &self,
            _ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            Ok(())
        }

        async fn perform_replication(
            &self,
            ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            ctx.put("attempted", "yes");
            let next = {
                let mut scripts = self.scripts.lock();
                match scripts.get_mut(&self.step_name) {
                    Some(outcomes) if !outcomes.is_empty() => outcomes.remove(0),
                    _ => None,
                }
            };
            match next {
                Some(error) => Err(ReplicationError::Execution(error)),
                None => Ok(()),
            }
        }

        async fn update_execution_details(
            &self,
            _ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            Ok(())
        }
    }

    fn runner_with(
        scripts_by_step: &[(&str, Script)],
    ) -> (JobRunner, ScheduledPolicy, Arc<MemoryInstanceStore>) {
        let store = Arc::new(MemoryInstanceStore::new());
        let helper = StoreHelper::new(
            Arc::clone(&store) as Arc<dyn InstanceStore>,
            EventPublisher::new(16),
            4000,
        );
        let registry = Arc::new(JobRegistry::new());
        let scripts = Arc::new(Mutex::new(
            scripts_by_step
                .iter()
                .map(|(name, script)| (name.to_string(), script.clone()))
                .collect::<std::collections::HashMap<_, _>>(),
        ));
        registry.register("scripted", {
            let scripts = Arc::clone(&scripts);
            Arc::new(move |spec: &StepSpec| {
                Arc::new(ScriptedJob {
                    step_name: spec.name.clone(),
                    scripts: Arc::clone(&scripts),
                }) as Arc<dyn ReplicationJob>
            })
        });

        let steps = vec![
            StepSpec::new("export", "scripted"),
            StepSpec::new("transfer", "scripted"),
        ];
        let policy = ScheduledPolicy {
            policy_id: "p1".to_string(),
            steps,
            trigger: TriggerSpec::NeverEnding { frequency_seconds: 60 },
            retry: RetryPolicy {
                attempts: 2,
                delay_seconds: 1,
            },
        };
        let runner = JobRunner::new(
            helper,
            Arc::new(ExecutionGuard::new()),
            registry,
            RetryEngine::default(),
        );
        (runner, policy, store)
    }

    async fn register(store: &MemoryInstanceStore, policy_id: &str) {
        store.save_registration(policy_id, "{}").await.unwrap();
    }

    #[tokio::test]
    async fn test_two_step_chain_succeeds() {
        let (runner, policy, store) = runner_with(&[]);
        register(&store, "p1").await;

        runner.run_scheduled(&policy).await.unwrap();

        let instance = store.get_instance("p1@1").await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Success);
        assert_eq!(instance.current_offset, 1);
        for offset in 0..2 {
            let step = store.get_step("p1@1", offset).await.unwrap().unwrap();
            assert_eq!(step.status, JobStatus::Success);
            assert_eq!(step.run_count, 1);
        }
        assert!(!runner.guard().is_running("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_step_and_kill_rest() {
        let (runner, policy, store) = runner_with(&[(
            "export",
            vec![Some("disk full".to_string()), Some("disk full".to_string())],
        )]);
        register(&store, "p1").await;

        runner.run_scheduled(&policy).await.unwrap();

        let step0 = store.get_step("p1@1", 0).await.unwrap().unwrap();
        assert_eq!(step0.status, JobStatus::Failed);
        assert_eq!(step0.run_count, 2);
        let step1 = store.get_step("p1@1", 1).await.unwrap().unwrap();
        assert_eq!(step1.status, JobStatus::Killed);
        let instance = store.get_instance("p1@1").await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_overlapping_fire_is_ignored() {
        let (runner, policy, store) = runner_with(&[]);
        register(&store, "p1").await;

        // Simulate an in-flight run holding the guard.
        runner.guard().try_begin("p1", "p1@0").unwrap();
        runner.run_scheduled(&policy).await.unwrap();

        let instance = store.get_instance("p1@1").await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Ignored);
        assert_eq!(
            runner.guard().running_instance("p1"),
            Some("p1@0".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_terminally() {
        let (runner, mut policy, store) = runner_with(&[]);
        register(&store, "p1").await;
        policy.steps = vec![StepSpec::new("export", "missing")];

        runner.run_scheduled(&policy).await.unwrap();

        let step = store.get_step("p1@1", 0).await.unwrap().unwrap();
        assert_eq!(step.status, JobStatus::Failed);
        assert!(step.message.unwrap().contains("unknown job type"));
        let instance = store.get_instance("p1@1").await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Failed);
    }
}
