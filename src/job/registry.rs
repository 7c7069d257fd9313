//! Replication job registry.
//!
//! Different replication engines (filesystem copy, table/metadata sync, ...)
//! register a factory per job type; the runner resolves the unit of work once
//! per fire by the step's `job_type`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::job::ReplicationJob;
use crate::policy::StepSpec;

/// Builds a [`ReplicationJob`] for a concrete step definition.
pub trait ReplicationJobFactory: Send + Sync {
    fn build(&self, spec: &StepSpec) -> Arc<dyn ReplicationJob>;
}

// Closures work as factories for simple cases and in tests.
impl<F> ReplicationJobFactory for F
where
    F: Fn(&StepSpec) -> Arc<dyn ReplicationJob> + Send + Sync,
{
    fn build(&self, spec: &StepSpec) -> Arc<dyn ReplicationJob> {
        self(spec)
    }
}

/// Registry of job factories keyed by job type.
#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ReplicationJobFactory>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for a job type.
    pub fn register(&self, job_type: impl Into<String>, factory: Arc<dyn ReplicationJobFactory>) {
        let job_type = job_type.into();
        tracing::info!(job_type = %job_type, "registering replication job factory");
        self.factories.write().insert(job_type, factory);
    }

    /// Resolve the unit of work for a step. Unknown job types are a
    /// configuration fault surfaced to the caller.
    pub fn resolve(&self, spec: &StepSpec) -> Result<Arc<dyn ReplicationJob>> {
        let factories = self.factories.read();
        factories
            .get(&spec.job_type)
            .map(|factory| factory.build(spec))
            .ok_or_else(|| SchedulerError::UnknownJobType(spec.job_type.clone()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.read().contains_key(job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, ReplicationError};
    use async_trait::async_trait;

    struct NoopJob;

    #[async_trait]
    impl ReplicationJob for NoopJob {
        async fn establish_connection(
            &self,
            _ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            Ok(())
        }

        async fn perform_replication(
            &self,
            _ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            Ok(())
        }

        async fn update_execution_details(
            &self,
            _ctx: &mut JobContext,
        ) -> std::result::Result<(), ReplicationError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = JobRegistry::new();
        registry.register(
            "fs",
            Arc::new(|_spec: &StepSpec| Arc::new(NoopJob) as Arc<dyn ReplicationJob>),
        );
        assert!(registry.contains("fs"));
        assert!(registry.resolve(&StepSpec::new("copy", "fs")).is_ok());
    }

    #[test]
    fn test_unknown_job_type() {
        let registry = JobRegistry::new();
        match registry.resolve(&StepSpec::new("copy", "unknown")) {
            Err(SchedulerError::UnknownJobType(t)) => assert_eq!(t, "unknown"),
            _ => panic!("expected an unknown-job-type error"),
        }
    }
}
