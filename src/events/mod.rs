//! Domain events emitted on terminal instance transitions.
//!
//! Consumers (an events/audit subsystem, notification hooks) subscribe to the
//! broadcast channel; publishing succeeds whether or not anyone is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::JobStatus;

/// Kind of terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEventKind {
    Succeeded,
    Failed,
    Ignored,
    Killed,
    Deleted,
}

impl InstanceEventKind {
    /// Map a terminal status to its event kind. Non-terminal states produce
    /// no event.
    pub fn from_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Success => Some(Self::Succeeded),
            JobStatus::Failed => Some(Self::Failed),
            JobStatus::Ignored => Some(Self::Ignored),
            JobStatus::Killed => Some(Self::Killed),
            JobStatus::Deleted => Some(Self::Deleted),
            JobStatus::Submitted | JobStatus::Running => None,
        }
    }
}

/// One terminal transition of a policy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub instance_id: String,
    pub policy_id: String,
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Broadcast publisher for instance events.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<InstanceEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. A send error only means there are no subscribers,
    /// which is acceptable.
    pub fn publish(&self, event: InstanceEvent) {
        tracing::debug!(
            kind = ?event.kind,
            instance_id = %event.instance_id,
            "publishing instance event"
        );
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
