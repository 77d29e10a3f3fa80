//! Engine events.
//!
//! The engine reports what it does to an [`EventSink`] injected through
//! the [`EngineBuilder`](crate::engine::EngineBuilder). Events are
//! fire-and-forget: a sink never influences the engine's control flow.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};

use crate::core::{Routine, RoutineStatus};
use serde_json::{json, Value};

/// A committed status change.
pub const STATUS_CHANGED: &str = "routine.status_changed";
/// A task's `run` failed; the routine goes back on the queue.
pub const TASK_FAILED: &str = "routine.task_failed";
/// A routine ran out of attempts; its pipeline is being reverted.
pub const RETRIES_EXHAUSTED: &str = "routine.retries_exhausted";
/// A task's `revert` failed; the routine stays reverting.
pub const REVERT_FAILED: &str = "routine.revert_failed";

/// Payload of a [`STATUS_CHANGED`] event.
#[must_use]
pub fn status_changed(previous: RoutineStatus, routine: &Routine) -> Value {
    json!({
        "routine_id": routine.id,
        "pipeline_id": routine.pipeline_id,
        "task_name": routine.task_name,
        "from": previous,
        "to": routine.status,
    })
}

/// Payload of a failure event.
#[must_use]
pub fn routine_error(routine: &Routine, error: &str) -> Value {
    json!({
        "routine_id": routine.id,
        "pipeline_id": routine.pipeline_id,
        "task_name": routine.task_name,
        "attempt": routine.attempt_count,
        "error": error,
    })
}
