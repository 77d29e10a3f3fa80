//! The orchestration engine.
//!
//! This module provides:
//! - [`Engine`], the shared entry point, and its builder
//! - pipeline and routine handles exposing the mutating operations
//! - the status-change reactor run after every committed write
//! - the dispatcher and reverter invoked by queue deliveries
//! - the task endpoint and an in-process worker

mod dispatcher;
mod endpoint;
mod pipeline;
mod reactor;
mod reverter;
mod routine;

#[cfg(test)]
mod integration_tests;

pub use dispatcher::{DispatchOutcome, RoutineDispatcher};
pub use endpoint::{Delivery, EndpointResponse, LocalWorker, TaskEndpoint};
pub use pipeline::PipelineHandle;
pub use reverter::{RevertOutcome, RoutineReverter};
pub use routine::RoutineHandle;

use crate::config::EngineConfig;
use crate::core::{PipelineId, Routine, RoutineId, RoutineStatus};
use crate::errors::RoutineflowError;
use crate::events::{self, EventSink, NoOpEventSink};
use crate::locks::{InMemoryLockManager, LockManager};
use crate::queue::{LocalTaskQueue, PushReceipt, QueueClient, TaskQueue, TaskTarget};
use crate::store::{InMemoryRoutineStore, RoutineMutation, RoutineStore};
use crate::tasks::TaskRegistry;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared handle to every engine collaborator.
///
/// Cloning is cheap; clones share the same store, locks, registry and
/// queue.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn RoutineStore>,
    locks: Arc<dyn LockManager>,
    registry: Arc<TaskRegistry>,
    queue: QueueClient,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RoutineStore> {
        &self.store
    }

    /// Task registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Queue client.
    #[must_use]
    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub(crate) fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Creates an empty pipeline.
    pub async fn create_pipeline(&self, name: &str) -> Result<PipelineHandle, RoutineflowError> {
        let pipeline = self.store.create_pipeline(name).await?;
        debug!(pipeline_id = %pipeline.id, name = %pipeline.name, "Pipeline created");
        Ok(PipelineHandle::new(self.clone(), pipeline))
    }

    /// Loads a pipeline.
    pub async fn pipeline(&self, id: PipelineId) -> Result<PipelineHandle, RoutineflowError> {
        let pipeline = self.store.get_pipeline(id).await?;
        Ok(PipelineHandle::new(self.clone(), pipeline))
    }

    /// Deletes a pipeline that owns no routines.
    pub async fn delete_pipeline(&self, id: PipelineId) -> Result<(), RoutineflowError> {
        self.store.delete_pipeline(id).await
    }

    /// Loads a routine.
    pub async fn routine(&self, id: RoutineId) -> Result<RoutineHandle, RoutineflowError> {
        let routine = self.store.get_routine(id).await?;
        Ok(RoutineHandle::new(self.clone(), routine))
    }

    /// Deletes a routine that no edge references.
    pub async fn delete_routine(&self, id: RoutineId) -> Result<(), RoutineflowError> {
        self.store.delete_routine(id).await
    }

    /// Dispatcher bound to this engine.
    #[must_use]
    pub fn dispatcher(&self) -> RoutineDispatcher {
        RoutineDispatcher::new(self.clone())
    }

    /// Reverter bound to this engine.
    #[must_use]
    pub fn reverter(&self) -> RoutineReverter {
        RoutineReverter::new(self.clone())
    }

    /// Task endpoint bound to this engine.
    #[must_use]
    pub fn endpoint(&self) -> TaskEndpoint {
        TaskEndpoint::new(self.clone())
    }

    /// Pushes the message a routine is waiting for again.
    ///
    /// Covers a queue push that failed after its status write committed:
    /// a SCHEDULED routine gets a dispatcher message, a REVERTING one a
    /// reverter message. Other statuses wait for nothing and yield `None`.
    pub async fn redeliver(
        &self,
        routine_id: RoutineId,
    ) -> Result<Option<PushReceipt>, RoutineflowError> {
        let routine = self.store.get_routine(routine_id).await?;
        let target = match routine.status {
            RoutineStatus::Scheduled => TaskTarget::Dispatcher,
            RoutineStatus::Reverting => TaskTarget::Reverter,
            status => {
                debug!(routine_id = %routine_id, %status, "Nothing to redeliver");
                return Ok(None);
            }
        };
        let receipt = self
            .queue
            .push_task(target, routine_id, Duration::ZERO)
            .await?;
        Ok(Some(receipt))
    }

    /// Commits a routine write, then reacts to the status change.
    ///
    /// Boxed because the reactor writes routines in turn.
    pub(crate) fn write_routine(
        &self,
        id: RoutineId,
        mutation: RoutineMutation,
    ) -> BoxFuture<'_, Result<Routine, RoutineflowError>> {
        async move {
            let change = self.store.update_routine(id, mutation).await?;
            if change.status_changed() {
                debug!(
                    routine_id = %id,
                    pipeline_id = %change.current.pipeline_id,
                    from = %change.previous.status,
                    to = %change.current.status,
                    "Routine status changed"
                );
                self.events.try_emit(
                    events::STATUS_CHANGED,
                    Some(events::status_changed(change.previous.status, &change.current)),
                );
                reactor::react(self, &change).await?;
            }
            Ok(change.current)
        }
        .boxed()
    }
}

/// Builder for [`Engine`].
///
/// Every collaborator has an in-memory default.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn RoutineStore>>,
    locks: Option<Arc<dyn LockManager>>,
    registry: Option<Arc<TaskRegistry>>,
    transport: Option<Arc<dyn TaskQueue>>,
    events: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Creates a builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RoutineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the lock manager.
    #[must_use]
    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Sets the task registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the queue transport.
    #[must_use]
    pub fn queue(mut self, transport: Arc<dyn TaskQueue>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        let config = Arc::new(self.config.unwrap_or_default());
        let poll_interval = config.lock_poll_interval();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTaskQueue::new()));

        Engine {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryRoutineStore::new())),
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(InMemoryLockManager::with_poll_interval(poll_interval))),
            registry: self.registry.unwrap_or_default(),
            queue: QueueClient::new(transport, Arc::clone(&config)),
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            config,
        }
    }
}
