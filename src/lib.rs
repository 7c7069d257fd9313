//! # replicore
//!
//! Scheduling and job-lifecycle orchestration for recurring, multi-step
//! data-replication policies.
//!
//! A policy compiles into an ordered chain of step jobs plus a recurring
//! trigger. The scheduling engine fires triggers, the execution guard keeps
//! at most one instance of a policy running at a time, the job runner drives
//! each instance through its persisted state machine
//! (`SUBMITTED → RUNNING → {SUCCESS, FAILED, KILLED, IGNORED}`), failed
//! steps are retried with bounded backoff, and the recovery service resumes
//! instances left `RUNNING` by an unclean shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use replicore::config::ReplicoreConfig;
//! use replicore::policy::{ReplicationPolicy, StepSpec};
//! use replicore::scheduler::ReplicationScheduler;
//! use replicore::store::MemoryInstanceStore;
//!
//! # async fn example() -> replicore::error::Result<()> {
//! let config = ReplicoreConfig::default();
//! let scheduler = ReplicationScheduler::new(Arc::new(MemoryInstanceStore::new()), &config);
//! // Register job factories on scheduler.registry(), then:
//! scheduler.start().await?;
//! let policy = ReplicationPolicy::new("fs-nightly", 86_400, vec![StepSpec::new("copy", "fs")]);
//! scheduler.schedule_policy(&policy).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod policy;
pub mod scheduler;
pub mod store;

pub use config::ReplicoreConfig;
pub use error::{Result, SchedulerError};
pub use events::{EventPublisher, InstanceEvent, InstanceEventKind};
pub use job::{ContextSnapshot, JobContext, JobRegistry, JobStatus, ReplicationError, ReplicationJob};
pub use policy::{ReplicationPolicy, RetryPolicy, StepSpec};
pub use scheduler::{JobKey, RecoverySummary, ReplicationScheduler, TriggerSpec};
pub use store::{InstanceStore, MemoryInstanceStore, PgInstanceStore, StoreHelper};
