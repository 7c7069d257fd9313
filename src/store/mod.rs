//! Persisted state: instance records, step records, and durable scheduler
//! registrations.
//!
//! The persisted store is the durability boundary of the scheduler. All
//! mutations go through [`helper::StoreHelper`]; the [`InstanceStore`] trait
//! is the seam between the scheduling logic and the concrete backend
//! ([`postgres::PgInstanceStore`] in production, [`memory::MemoryInstanceStore`]
//! for tests and embedded runs).
//!
//! Status-changing updates are conditional on the row's current status so a
//! racing retry fire and a recovery-driven resume cannot produce lost
//! updates: the first terminal write wins and later ones change nothing.

pub mod helper;
pub mod memory;
pub mod postgres;

pub use helper::StoreHelper;
pub use memory::MemoryInstanceStore;
pub use postgres::PgInstanceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobStatus;

/// One execution lifecycle of a policy. `instance_id` is
/// `policyId@runCount` with a per-policy monotonic run count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub policy_id: String,
    pub status: JobStatus,
    /// Index of the step currently executing or last completed.
    pub current_offset: u32,
    pub start_time: Option<DateTime<Utc>>,
    /// Null while the instance is active.
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Soft-delete marker; instances are retired, never removed (except via
    /// bulk purge of old retired records).
    pub deletion_time: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<String>, policy_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            policy_id: policy_id.into(),
            status: JobStatus::Submitted,
            current_offset: 0,
            start_time: None,
            end_time: None,
            message: None,
            deletion_time: None,
        }
    }
}

/// One step of an instance's chain, keyed by `(instance_id, offset)`.
/// Steps are created contiguously at offsets `0..N-1` before execution
/// begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub instance_id: String,
    pub offset: u32,
    pub status: JobStatus,
    /// Attempts made for this step; incremented when an attempt starts.
    pub run_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Serialized [`crate::job::ContextSnapshot`] for recovery.
    pub context_data: Option<String>,
    pub deletion_time: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(instance_id: impl Into<String>, offset: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            offset,
            status: JobStatus::Submitted,
            run_count: 0,
            start_time: None,
            end_time: None,
            message: None,
            context_data: None,
            deletion_time: None,
        }
    }
}

/// A durable job registration: the engine's own record of a scheduled
/// policy, kept so the job remains known across restarts before recovery
/// runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub policy_id: String,
    /// Serialized scheduled-policy payload (steps, trigger, retry budget).
    pub payload: String,
}

/// Persistence seam for instance, step, and registration state.
///
/// Methods returning `bool` report whether a row actually changed, which the
/// store helper uses to emit terminal events exactly once.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, record: InstanceRecord) -> Result<()>;

    /// Insert the contiguous step rows for an instance in one call, so step
    /// `k + 1` always exists by the time step `k` completes.
    async fn insert_steps(&self, steps: Vec<StepRecord>) -> Result<()>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    async fn get_step(&self, instance_id: &str, offset: u32) -> Result<Option<StepRecord>>;

    /// `SUBMITTED → RUNNING` with start time; no-op unless still submitted.
    async fn mark_instance_running(
        &self,
        instance_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<bool>;

    async fn update_instance_offset(&self, instance_id: &str, offset: u32) -> Result<()>;

    /// Terminal transition of an instance, conditional on a non-terminal
    /// current status.
    async fn complete_instance(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<bool>;

    /// Step `SUBMITTED|RUNNING → RUNNING` with start time (retried attempts
    /// start from `RUNNING` again).
    async fn mark_step_running(
        &self,
        instance_id: &str,
        offset: u32,
        start_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a message on a step without changing its status (used while a
    /// retry is pending).
    async fn set_step_message(&self, instance_id: &str, offset: u32, message: String)
        -> Result<()>;

    /// Terminal transition of a step, conditional on a non-terminal current
    /// status.
    async fn complete_step(
        &self,
        instance_id: &str,
        offset: u32,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
        context_data: Option<String>,
    ) -> Result<bool>;

    /// Bulk-transition every step of the instance still `SUBMITTED`; returns
    /// the number of rows changed.
    async fn mark_remaining_steps(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
    ) -> Result<u64>;

    /// Increment and return a step's attempt count.
    async fn increment_step_run_count(&self, instance_id: &str, offset: u32) -> Result<u32>;

    async fn find_instances_by_status(&self, status: JobStatus) -> Result<Vec<InstanceRecord>>;

    /// Soft-delete an instance and its steps (`DELETED` tombstone plus
    /// deletion time).
    async fn retire_instance(
        &self,
        instance_id: &str,
        deletion_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Bulk-remove retired instances (and their steps) whose deletion time is
    /// older than the cutoff; returns the number of instances purged.
    async fn purge_retired(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Insert or replace a durable job registration. The per-policy run
    /// counter on an existing row is preserved.
    async fn save_registration(&self, policy_id: &str, payload: &str) -> Result<()>;

    async fn delete_registration(&self, policy_id: &str) -> Result<bool>;

    async fn load_registrations(&self) -> Result<Vec<RegistrationRecord>>;

    /// Advance and return the policy's monotonic run counter (first call
    /// returns 1). Errors when the policy has no registration.
    async fn next_run_count(&self, policy_id: &str) -> Result<i64>;
}
