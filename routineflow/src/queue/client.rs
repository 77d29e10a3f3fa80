//! Builds queue messages and pushes them, with backup-queue fallback.

use super::{PushReceipt, QueueMessage, RoutinePayload, TaskQueue, TaskTarget};
use crate::config::EngineConfig;
use crate::core::RoutineId;
use crate::errors::{QueueError, RoutineflowError};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Client used by the engine to reach the task queue.
#[derive(Clone)]
pub struct QueueClient {
    transport: Arc<dyn TaskQueue>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("queue", &self.config.queue_name())
            .field("domain", &self.config.domain)
            .finish()
    }
}

impl QueueClient {
    /// Creates a client over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn TaskQueue>, config: Arc<EngineConfig>) -> Self {
        Self { transport, config }
    }

    /// Builds an immediate message for `task_name` on the default queue.
    #[must_use]
    pub fn build_message(&self, task_name: &str, payload: Value) -> QueueMessage {
        let queue = self.config.queue_name().to_string();
        let delimiter = &self.config.delimiter;
        QueueMessage {
            name: format!("{queue}{delimiter}{task_name}{delimiter}{}", Uuid::new_v4().simple()),
            queue,
            task_name: task_name.to_string(),
            url: self.config.task_url(task_name),
            payload,
            delay: Duration::ZERO,
        }
    }

    /// Pushes a message, retrying once on the backup queue when the
    /// original queue was deleted recently.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or `DeletedRecently` when no backup
    /// queue is configured.
    pub async fn push(&self, message: QueueMessage) -> Result<PushReceipt, QueueError> {
        debug!(
            queue = %message.queue,
            task_name = %message.task_name,
            delay_ms = message.delay.as_millis() as u64,
            "Pushing task"
        );

        match self.transport.push(message.clone()).await {
            Err(QueueError::DeletedRecently { queue }) => {
                let Some(backup) = self.config.backup_queue(&queue) else {
                    return Err(QueueError::DeletedRecently { queue });
                };
                warn!(queue = %queue, backup_queue = backup, "Queue deleted recently, using backup queue");
                self.transport.push(message.with_queue(backup)).await
            }
            other => other,
        }
    }

    /// Pushes `task_name` for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns the queue error.
    pub async fn asap(&self, task_name: &str, payload: Value) -> Result<PushReceipt, QueueError> {
        self.push(self.build_message(task_name, payload)).await
    }

    /// Pushes `task_name` for delivery after `delay`.
    ///
    /// # Errors
    ///
    /// Returns the queue error.
    pub async fn later(
        &self,
        task_name: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<PushReceipt, QueueError> {
        self.push(self.build_message(task_name, payload).with_delay(delay))
            .await
    }

    /// Pushes `task_name` for delivery at a random moment before `max_date`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchedule` when `max_date` is in the past, or the
    /// queue error.
    pub async fn until(
        &self,
        task_name: &str,
        payload: Value,
        max_date: DateTime<Utc>,
    ) -> Result<PushReceipt, RoutineflowError> {
        let max_seconds = (max_date - Utc::now()).num_seconds();
        if max_seconds < 0 {
            return Err(RoutineflowError::InvalidSchedule(
                "max_date must be in the future".to_string(),
            ));
        }
        let delay = rand::thread_rng().gen_range(0..=max_seconds.unsigned_abs());
        Ok(self
            .later(task_name, payload, Duration::from_secs(delay))
            .await?)
    }

    /// Pushes a dispatcher or reverter message for a routine.
    ///
    /// # Errors
    ///
    /// Returns the queue error.
    pub async fn push_task(
        &self,
        target: TaskTarget,
        routine_id: RoutineId,
        delay: Duration,
    ) -> Result<PushReceipt, RoutineflowError> {
        let payload = serde_json::to_value(RoutinePayload { routine_id })?;
        Ok(self.later(target.task_name(), payload, delay).await?)
    }
}
