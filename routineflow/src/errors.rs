//! Error types for the routineflow engine.
//!
//! Engine errors are the ones allowed to reach the caller of a mutating
//! operation: illegal transitions, constraint violations, missing records,
//! lock and queue failures. Failures raised by a task's own `run` or
//! `revert` are a separate type ([`TaskError`]) and are recorded on the
//! routine instead of being propagated.

use crate::core::{PipelineId, RoutineId, RoutineStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for routineflow operations.
#[derive(Debug, Error)]
pub enum RoutineflowError {
    /// A status change not allowed by the routine state machine.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// A routine was created with a status other than `pending`.
    #[error("The initial routine's status must be 'pending' not '{0}'")]
    InvalidInitialStatus(RoutineStatus),

    /// The task name does not resolve in the registry.
    #[error("Task {name} not registered.")]
    TaskNotFound {
        /// The unknown task name.
        name: String,
    },

    /// The task exists but cannot back a routine.
    #[error("Task {name} is registered as '{kind}' and cannot be used as a routine")]
    TaskKindMismatch {
        /// The task name.
        name: String,
        /// The registered kind.
        kind: String,
    },

    /// A storage-level check constraint rejected the write.
    #[error("constraint failed: {constraint} (routine #{routine_id})")]
    ConstraintViolation {
        /// Constraint name.
        constraint: &'static str,
        /// The routine being written.
        routine_id: RoutineId,
    },

    /// The routine does not exist.
    #[error("Routine #{0} not found")]
    RoutineNotFound(RoutineId),

    /// The pipeline does not exist.
    #[error("Pipeline #{0} not found")]
    PipelineNotFound(PipelineId),

    /// The edge already exists.
    #[error("Edge #{from} -> #{to} already exists")]
    DuplicateEdge {
        /// Source routine.
        from: RoutineId,
        /// Target routine.
        to: RoutineId,
    },

    /// The edge would link routines it must not link.
    #[error("Invalid edge #{from} -> #{to}: {reason}")]
    InvalidEdge {
        /// Source routine.
        from: RoutineId,
        /// Target routine.
        to: RoutineId,
        /// Why the edge was refused.
        reason: String,
    },

    /// Deleting the record would orphan rows that reference it.
    #[error("Cannot delete {record}: still referenced by {referenced_by}")]
    ProtectedRecord {
        /// Description of the record.
        record: String,
        /// What still references it.
        referenced_by: String,
    },

    /// A scheduling request cannot be honoured.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A delivery header could not be parsed.
    #[error("Invalid header {name}: '{value}'")]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Raw header value.
        value: String,
    },

    /// A task body is valid JSON but not an object.
    #[error("Invalid task body: expected a JSON object, got {0}")]
    InvalidBody(String),

    /// Lock acquisition failed.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// Queue transport failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoutineflowError {
    /// Creates a task not found error.
    #[must_use]
    pub fn task_not_found(name: impl Into<String>) -> Self {
        Self::TaskNotFound { name: name.into() }
    }

    /// Returns true if redelivering the same message may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Lock(LockError::Timeout { .. }) | Self::Queue(QueueError::Transport { .. })
        )
    }
}

/// Error raised when a routine status update is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Status update from '{from}' to '{to}' is not allowed")]
pub struct InvalidTransitionError {
    /// The persisted status.
    pub from: RoutineStatus,
    /// The requested status.
    pub to: RoutineStatus,
}

impl InvalidTransitionError {
    /// Creates a new invalid transition error.
    #[must_use]
    pub fn new(from: RoutineStatus, to: RoutineStatus) -> Self {
        Self { from, to }
    }
}

/// Errors from the mutual-exclusion lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock was not acquired within the wait window.
    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    Timeout {
        /// The lock key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The lock backend itself failed.
    #[error("Lock backend error for '{key}': {message}")]
    Backend {
        /// The lock key.
        key: String,
        /// Backend message.
        message: String,
    },
}

/// Errors from the task-queue transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was deleted recently and cannot be recreated yet.
    #[error("Queue '{queue}' was deleted recently")]
    DeletedRecently {
        /// The queue name.
        queue: String,
    },

    /// The push was rejected or the transport is unreachable.
    #[error("Failed to push to queue '{queue}': {message}")]
    Transport {
        /// The queue name.
        queue: String,
        /// Transport message.
        message: String,
    },
}

/// Error raised by a task's `run` or `revert`.
///
/// Tasks return this instead of panicking; the dispatcher stores
/// `{"error": message}` as the routine output.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskError {
    /// Human readable message, stored on the routine.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl TaskError {
    /// Creates a new task error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// The output recorded on a routine that failed with this error.
    #[must_use]
    pub fn to_output(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.message })
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = RoutineflowError> = std::result::Result<T, E>;
