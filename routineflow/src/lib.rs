//! # Routineflow
//!
//! DAG workflow orchestration over an at-least-once task queue.
//!
//! A pipeline is a directed acyclic graph of routines. Each routine runs a
//! registered task with a compensating action. Routines are never run
//! in-line: the engine pushes a message to a task queue and the queue
//! delivers it back to the engine's endpoint. Routines provide:
//!
//! - **A persisted state machine**: every status write is validated
//!   against the stored status inside one atomic section
//! - **Forward cascades**: a completed routine enqueues the next routines
//!   whose upstream routines all completed
//! - **Bounded retries**: failed runs are re-enqueued until `max_retries`
//!   is reached, then the whole pipeline is reverted
//! - **Backward cascades**: a reverted routine reverts the routines it
//!   ran after, so compensation walks the graph from the leaves back
//! - **Mutual exclusion**: dispatcher and reverter deliveries for one
//!   routine hold a lease lock, so duplicate deliveries are harmless
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use routineflow::prelude::*;
//!
//! let engine = Engine::builder().build();
//! engine.registry().register(Arc::new(FnTask::new("SayHelloTask", |_| async {
//!     Ok(json!({"message": "hello"}))
//! })));
//!
//! let pipeline = engine.create_pipeline("greetings").await?;
//! let first = pipeline.add_routine(RoutineSpec::new("SayHelloTask")).await?;
//! first.add_next(RoutineSpec::new("SayHelloTask").with_max_retries(3)).await?;
//! pipeline.start().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod locks;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tasks;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, LockSettings};
    pub use crate::core::{
        Pipeline, PipelineId, Routine, RoutineBody, RoutineEdge, RoutineId, RoutineSpec,
        RoutineStatus,
    };
    pub use crate::engine::{
        DispatchOutcome, Engine, EngineBuilder, LocalWorker, PipelineHandle, RevertOutcome,
        RoutineHandle, TaskEndpoint,
    };
    pub use crate::errors::{RoutineflowError, TaskError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::locks::{InMemoryLockManager, LockManager};
    pub use crate::queue::{LocalTaskQueue, QueueClient, TaskQueue};
    pub use crate::retry::RetryBackoff;
    pub use crate::store::{InMemoryRoutineStore, RoutineStore};
    pub use crate::tasks::{FnTask, RoutineTask, TaskKind, TaskRegistry};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn library_compiles() {
        let engine = Engine::builder().build();
        assert!(engine.registry().is_empty());
        assert_eq!(engine.config().queue_name(), "tasks");
    }
}
