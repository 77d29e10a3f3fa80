//! In-process task queue.

use super::{PushReceipt, QueueMessage, TaskQueue};
use crate::errors::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// FIFO queue kept in memory.
///
/// Delays are recorded on the message but not waited for; a
/// [`LocalWorker`](crate::engine::LocalWorker) drains messages in push
/// order. Queues can be marked as recently deleted to exercise the
/// backup-queue path.
///
/// Delivered messages are dropped; a push history is only kept when the
/// queue is built with [`LocalTaskQueue::with_history`].
#[derive(Debug, Default)]
pub struct LocalTaskQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    history: Option<Mutex<Vec<QueueMessage>>>,
    deleted: Mutex<HashSet<String>>,
}

impl LocalTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue that records every accepted push.
    #[must_use]
    pub fn with_history() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Makes pushes to `queue` fail with `DeletedRecently`.
    pub fn mark_deleted(&self, queue: impl Into<String>) {
        self.deleted.lock().insert(queue.into());
    }

    /// Accepts pushes to `queue` again.
    pub fn restore(&self, queue: &str) {
        self.deleted.lock().remove(queue);
    }

    /// Takes the oldest pending message.
    pub fn pop(&self) -> Option<QueueMessage> {
        self.pending.lock().pop_front()
    }

    /// Puts a delivered message back at the end of the queue.
    ///
    /// Unlike a push, a requeue is not recorded in the history.
    pub fn requeue(&self, message: QueueMessage) {
        self.pending.lock().push_back(message);
    }

    /// Pending messages, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<QueueMessage> {
        self.pending.lock().iter().cloned().collect()
    }

    /// Every message accepted since the last `clear`, in push order.
    ///
    /// Always empty unless the queue records its history.
    #[must_use]
    pub fn history(&self) -> Vec<QueueMessage> {
        self.history
            .as_ref()
            .map(|history| history.lock().clone())
            .unwrap_or_default()
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drops pending messages and history.
    pub fn clear(&self) {
        self.pending.lock().clear();
        if let Some(history) = &self.history {
            history.lock().clear();
        }
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn push(&self, message: QueueMessage) -> Result<PushReceipt, QueueError> {
        if self.deleted.lock().contains(&message.queue) {
            return Err(QueueError::DeletedRecently {
                queue: message.queue,
            });
        }

        let receipt = PushReceipt {
            queue: message.queue.clone(),
            name: message.name.clone(),
        };
        if let Some(history) = &self.history {
            history.lock().push(message.clone());
        }
        self.pending.lock().push_back(message);
        Ok(receipt)
    }
}
