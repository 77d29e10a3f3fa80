//! Test harness wiring an engine to an in-process queue.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, LockSettings};
use crate::core::{Routine, RoutineId, RoutineStatus};
use crate::engine::{Delivery, Engine, LocalWorker, PipelineHandle};
use crate::errors::RoutineflowError;
use crate::events::CollectingEventSink;
use crate::queue::{LocalTaskQueue, RoutinePayload, TaskTarget};
use crate::retry::RetryBackoff;
use crate::tasks::RoutineTask;

/// Configuration used by [`TestHarness::new`]: no retry delay, and locks
/// that give up at once so contention surfaces as a timeout.
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_app_name("tests")
        .with_domain("http://localhost:8080")
        .with_retry_backoff(RetryBackoff::immediate())
        .with_lock_settings(LockSettings {
            wait_seconds: 0,
            lease_seconds: 30,
        })
        .with_lock_poll_interval(Duration::from_millis(5))
}

/// An engine, its local queue, a worker draining that queue and a sink
/// collecting every event.
#[derive(Debug, Clone)]
pub struct TestHarness {
    /// The engine under test.
    pub engine: Engine,
    /// Queue the engine pushes to; it records its push history.
    pub queue: Arc<LocalTaskQueue>,
    /// Worker delivering queued messages to the engine's endpoint.
    pub worker: LocalWorker,
    /// Events emitted by the engine.
    pub events: Arc<CollectingEventSink>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with [`test_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with the given configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let queue = Arc::new(LocalTaskQueue::with_history());
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::builder()
            .config(config)
            .queue(queue.clone())
            .event_sink(events.clone())
            .build();
        let worker = LocalWorker::new(queue.clone(), engine.endpoint());

        Self {
            engine,
            queue,
            worker,
            events,
        }
    }

    /// Registers a routine task and hands it back.
    pub fn register<T: RoutineTask + 'static>(&self, task: T) -> Arc<T> {
        let task = Arc::new(task);
        self.engine.registry().register(task.clone());
        task
    }

    /// Creates an empty pipeline.
    pub async fn pipeline(&self, name: &str) -> Result<PipelineHandle, RoutineflowError> {
        self.engine.create_pipeline(name).await
    }

    /// Drains the queue through the worker.
    pub async fn run_until_idle(&self) -> Result<Vec<Delivery>, RoutineflowError> {
        self.worker.run_until_idle().await
    }

    /// Loads a routine.
    pub async fn routine(&self, id: RoutineId) -> Result<Routine, RoutineflowError> {
        self.engine.store().get_routine(id).await
    }

    /// Loads a routine's status.
    pub async fn status(&self, id: RoutineId) -> Result<RoutineStatus, RoutineflowError> {
        Ok(self.routine(id).await?.status)
    }

    /// Routine ids of every message ever pushed to `target`, in push order.
    #[must_use]
    pub fn pushed(&self, target: TaskTarget) -> Vec<RoutineId> {
        self.queue
            .history()
            .into_iter()
            .filter(|message| message.task_name == target.task_name())
            .filter_map(|message| serde_json::from_value::<RoutinePayload>(message.payload).ok())
            .map(|payload| payload.routine_id)
            .collect()
    }

    /// How many messages were pushed to `target` for `routine_id`.
    #[must_use]
    pub fn push_count(&self, target: TaskTarget, routine_id: RoutineId) -> usize {
        self.pushed(target)
            .into_iter()
            .filter(|id| *id == routine_id)
            .count()
    }
}
