//! Unit-of-work contract and supporting types.
//!
//! The scheduler treats the actual replication work as opaque: a
//! [`ReplicationJob`] establishes its connection, performs the transfer, and
//! records execution details into the shared [`JobContext`]. Implementations
//! live outside this core and are resolved through the [`registry`].

pub mod context;
pub mod registry;
pub mod status;

pub use context::{ContextSnapshot, JobContext};
pub use registry::{JobRegistry, ReplicationJobFactory};
pub use status::JobStatus;

use async_trait::async_trait;

/// Failure reported by a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("replication failed: {0}")]
    Execution(String),

    /// The work observed the interrupt flag and terminated its resources.
    #[error("replication interrupted")]
    Interrupted,
}

/// One step's replication work, executed synchronously from the runner's
/// point of view. Implementations must check [`JobContext::should_interrupt`]
/// cooperatively between long-running operations.
#[async_trait]
pub trait ReplicationJob: Send + Sync {
    /// Validate connectivity to source/target before any data moves.
    async fn establish_connection(&self, ctx: &mut JobContext) -> Result<(), ReplicationError>;

    /// Perform the replication work for this step.
    async fn perform_replication(&self, ctx: &mut JobContext) -> Result<(), ReplicationError>;

    /// Record progress/resumption details into the context; persisted as the
    /// step's `context_data` after completion.
    async fn update_execution_details(&self, ctx: &mut JobContext) -> Result<(), ReplicationError>;
}
