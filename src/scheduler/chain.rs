//! Chain advancement over an instance's ordered step list.
//!
//! A policy compiles to steps at offsets `0..N-1`; the chain is that ordered
//! list, not a separate key-to-key map. Successful completion of step `k`
//! advances directly to `k + 1`; terminal failure or a kill abandons every
//! step that never started so the instance cannot hang in `SUBMITTED`.

use crate::error::Result;
use crate::store::StoreHelper;

/// Stateless chain logic over a step count.
#[derive(Debug, Clone, Copy)]
pub struct ChainCoordinator {
    step_count: usize,
}

impl ChainCoordinator {
    pub fn new(step_count: usize) -> Self {
        Self { step_count }
    }

    /// Offset of the step after `offset`, if the chain continues.
    pub fn next_offset(&self, offset: u32) -> Option<u32> {
        let next = offset as usize + 1;
        (next < self.step_count).then_some(next as u32)
    }

    /// Bulk-`KILLED` the instance's un-run steps and report how many were
    /// abandoned.
    pub async fn abandon_remaining(&self, store: &StoreHelper, instance_id: &str) -> Result<u64> {
        let abandoned = store.kill_remaining_steps(instance_id).await?;
        if abandoned > 0 {
            tracing::info!(
                instance_id = %instance_id,
                abandoned,
                "abandoned remaining chain steps"
            );
        }
        Ok(abandoned)
    }
}
