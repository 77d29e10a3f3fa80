//! Task-queue plumbing.
//!
//! The engine never runs routines in-line: it pushes a message naming the
//! dispatcher or the reverter to an at-least-once queue, and the queue
//! delivers it back to the [`TaskEndpoint`](crate::engine::TaskEndpoint).

mod client;
mod local;
mod metadata;

pub use client::QueueClient;
pub use local::LocalTaskQueue;
pub use metadata::TaskMetadata;

use crate::core::RoutineId;
use crate::errors::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Engine task a routine message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskTarget {
    /// Runs one attempt of a routine.
    Dispatcher,
    /// Runs a routine's compensating action.
    Reverter,
}

impl TaskTarget {
    /// Both targets.
    pub const ALL: [Self; 2] = [Self::Dispatcher, Self::Reverter];

    /// Task name the target is delivered under.
    #[must_use]
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::Dispatcher => "PipelineRoutineTask",
            Self::Reverter => "PipelineRoutineRevertTask",
        }
    }

    /// Resolves a delivered task name.
    #[must_use]
    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|target| target.task_name() == name)
    }
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_name())
    }
}

/// Body of a dispatcher or reverter message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutinePayload {
    /// The routine to work on.
    pub routine_id: RoutineId,
}

/// A message ready to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Destination queue.
    pub queue: String,
    /// Unique message name.
    pub name: String,
    /// Task the message is delivered to.
    pub task_name: String,
    /// Delivery URL.
    pub url: String,
    /// JSON body.
    pub payload: serde_json::Value,
    /// Delay before delivery.
    pub delay: Duration,
}

impl QueueMessage {
    /// Sends the message to another queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the delivery delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Acknowledgement of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReceipt {
    /// Queue that accepted the message.
    pub queue: String,
    /// Name of the accepted message.
    pub name: String,
}

/// Transport to an at-least-once task queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Pushes a message.
    async fn push(&self, message: QueueMessage) -> Result<PushReceipt, QueueError>;
}
