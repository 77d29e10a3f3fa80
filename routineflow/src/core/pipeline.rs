//! Pipeline and edge records.

use super::RoutineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a pipeline, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named DAG of routines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Unique identifier.
    pub id: PipelineId,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the pipeline started reverting, if it did.
    ///
    /// Once set, routines that finish an attempt are reverted instead of
    /// moving the pipeline forward.
    #[serde(default)]
    pub reverting_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Returns true once the pipeline started reverting.
    #[must_use]
    pub fn is_reverting(&self) -> bool {
        self.reverting_at.is_some()
    }
}

/// Directed edge `routine -> next_routine`.
///
/// The source must finish before the target is enqueued, and the target
/// is reverted before the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutineEdge {
    /// Upstream routine.
    pub routine_id: RoutineId,
    /// Downstream routine.
    pub next_routine_id: RoutineId,
}

impl RoutineEdge {
    /// Creates a new edge.
    #[must_use]
    pub fn new(routine_id: RoutineId, next_routine_id: RoutineId) -> Self {
        Self {
            routine_id,
            next_routine_id,
        }
    }
}

impl fmt::Display for RoutineEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} -> #{}", self.routine_id, self.next_routine_id)
    }
}
