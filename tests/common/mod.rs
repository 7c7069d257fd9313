//! Shared harness for scheduler integration tests.
//!
//! Registers scripted replication jobs over an in-memory store:
//! `ok` always succeeds, `fail` always fails (message taken from the step's
//! `message` property), `flaky` fails a configured number of times per step
//! name before succeeding, and `block` spins until released or interrupted.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use replicore::config::ReplicoreConfig;
use replicore::job::{JobContext, ReplicationJob};
use replicore::policy::{ReplicationPolicy, RetryPolicy, StepSpec};
use replicore::scheduler::ReplicationScheduler;
use replicore::store::{InstanceRecord, InstanceStore, MemoryInstanceStore};
use replicore::{JobStatus, ReplicationError};

/// One recorded step attempt.
#[derive(Debug, Clone)]
pub struct Execution {
    pub instance_id: String,
    pub offset: u32,
    pub at: tokio::time::Instant,
}

#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Mutex<Vec<Execution>>,
}

impl ExecutionLog {
    fn record(&self, instance_id: &str, offset: u32) {
        self.entries.lock().push(Execution {
            instance_id: instance_id.to_string(),
            offset,
            at: tokio::time::Instant::now(),
        });
    }

    pub fn entries(&self) -> Vec<Execution> {
        self.entries.lock().clone()
    }

    pub fn attempts_for(&self, instance_id: &str, offset: u32) -> Vec<Execution> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.instance_id == instance_id && e.offset == offset)
            .cloned()
            .collect()
    }
}

enum Behavior {
    AlwaysOk,
    AlwaysFail,
    Flaky,
    Block,
}

struct TestJob {
    behavior: Behavior,
    step_name: String,
    message: String,
    log: Arc<ExecutionLog>,
    flaky: Arc<Mutex<HashMap<String, u32>>>,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl ReplicationJob for TestJob {
    async fn establish_connection(&self, _ctx: &mut JobContext) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn perform_replication(&self, ctx: &mut JobContext) -> Result<(), ReplicationError> {
        self.log.record(ctx.instance_id(), ctx.offset());
        match self.behavior {
            Behavior::AlwaysOk => {
                ctx.put("completed", self.step_name.clone());
                Ok(())
            }
            Behavior::AlwaysFail => Err(ReplicationError::Execution(self.message.clone())),
            Behavior::Flaky => {
                let mut budgets = self.flaky.lock();
                match budgets.get_mut(&self.step_name) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        Err(ReplicationError::Execution(self.message.clone()))
                    }
                    _ => Ok(()),
                }
            }
            Behavior::Block => loop {
                if ctx.should_interrupt() {
                    return Err(ReplicationError::Interrupted);
                }
                if self.released.load(Ordering::SeqCst) {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }

    async fn update_execution_details(&self, _ctx: &mut JobContext) -> Result<(), ReplicationError> {
        Ok(())
    }
}

pub struct Harness {
    pub scheduler: ReplicationScheduler,
    pub store: Arc<MemoryInstanceStore>,
    pub log: Arc<ExecutionLog>,
    flaky: Arc<Mutex<HashMap<String, u32>>>,
    released: Arc<AtomicBool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryInstanceStore::new()))
    }

    /// Build the harness over a pre-seeded store (recovery scenarios).
    pub fn over(store: Arc<MemoryInstanceStore>) -> Self {
        let config = ReplicoreConfig::default();
        let scheduler =
            ReplicationScheduler::new(Arc::clone(&store) as Arc<dyn InstanceStore>, &config);

        let log = Arc::new(ExecutionLog::default());
        let flaky = Arc::new(Mutex::new(HashMap::new()));
        let released = Arc::new(AtomicBool::new(false));

        for behavior_name in ["ok", "fail", "flaky", "block"] {
            let log = Arc::clone(&log);
            let flaky = Arc::clone(&flaky);
            let released = Arc::clone(&released);
            scheduler.registry().register(
                behavior_name,
                Arc::new(move |spec: &StepSpec| {
                    let behavior = match spec.job_type.as_str() {
                        "fail" => Behavior::AlwaysFail,
                        "flaky" => Behavior::Flaky,
                        "block" => Behavior::Block,
                        _ => Behavior::AlwaysOk,
                    };
                    Arc::new(TestJob {
                        behavior,
                        step_name: spec.name.clone(),
                        message: spec
                            .properties
                            .get("message")
                            .cloned()
                            .unwrap_or_else(|| "simulated failure".to_string()),
                        log: Arc::clone(&log),
                        flaky: Arc::clone(&flaky),
                        released: Arc::clone(&released),
                    }) as Arc<dyn ReplicationJob>
                }),
            );
        }

        Self {
            scheduler,
            store,
            log,
            flaky,
            released,
        }
    }

    /// Make the named flaky step fail its next `count` attempts.
    pub fn set_failures(&self, step_name: &str, count: u32) {
        self.flaky.lock().insert(step_name.to_string(), count);
    }

    /// Let every blocked job finish.
    pub fn release_blocked(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Let spawned tasks run without advancing paused time.
    pub async fn settle(&self) {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    /// Drive the paused clock forward until the instance reaches a terminal
    /// status. Pending timers (retry delays, trigger ticks) fire at their
    /// exact deadlines as the clock auto-advances.
    pub async fn run_until_terminal(&self, instance_id: &str, max_seconds: u64) -> InstanceRecord {
        for _ in 0..=max_seconds.div_ceil(5) {
            self.settle().await;
            if let Some(instance) = self.store.get_instance(instance_id).await.unwrap() {
                if instance.status.is_terminal() {
                    return instance;
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        panic!("instance {instance_id} did not reach a terminal status");
    }

    pub async fn instance(&self, instance_id: &str) -> InstanceRecord {
        self.store
            .get_instance(instance_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no instance {instance_id}"))
    }

    pub async fn step_status(&self, instance_id: &str, offset: u32) -> JobStatus {
        self.store
            .get_step(instance_id, offset)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no step {instance_id}/{offset}"))
            .status
    }
}

/// A policy whose steps all use the same scripted job type.
pub fn policy(id: &str, frequency_seconds: u64, steps: &[(&str, &str)]) -> ReplicationPolicy {
    let steps = steps
        .iter()
        .map(|(name, job_type)| StepSpec::new(*name, *job_type))
        .collect();
    ReplicationPolicy::new(id, frequency_seconds, steps)
}

pub fn with_retry(mut p: ReplicationPolicy, attempts: u32, delay_seconds: u64) -> ReplicationPolicy {
    p.retry = RetryPolicy {
        attempts,
        delay_seconds,
    };
    p
}
