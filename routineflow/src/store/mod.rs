//! Persistence contract for pipelines, routines and edges.
//!
//! Every routine write is a single atomic read-modify-write: the store
//! loads the persisted row, applies the caller's mutation to a copy,
//! validates the result against the persisted status and the row
//! constraints, and only then commits. A rejected write leaves the row
//! untouched.

mod memory;

pub use memory::InMemoryRoutineStore;

use crate::core::{
    ensure_transition, Pipeline, PipelineId, Routine, RoutineEdge, RoutineId, RoutineSpec,
};
use crate::errors::RoutineflowError;
use async_trait::async_trait;
use std::collections::HashSet;

/// A change applied to a routine inside the store's atomic section.
pub type RoutineMutation = Box<dyn FnOnce(&mut Routine) -> Result<(), RoutineflowError> + Send>;

/// The persisted row before and after a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineChange {
    /// Row as it was persisted before the write.
    pub previous: Routine,
    /// Row as committed.
    pub current: Routine,
}

impl RoutineChange {
    /// Returns true if the write changed the status.
    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.previous.status != self.current.status
    }
}

/// Storage backend for pipelines, routines and edges.
#[async_trait]
pub trait RoutineStore: Send + Sync {
    /// Creates a pipeline.
    async fn create_pipeline(&self, name: &str) -> Result<Pipeline, RoutineflowError>;

    /// Loads a pipeline.
    async fn get_pipeline(&self, id: PipelineId) -> Result<Pipeline, RoutineflowError>;

    /// Records that the pipeline is reverting and returns the row.
    ///
    /// The first call sets `reverting_at`; later calls keep it.
    async fn mark_pipeline_reverting(&self, id: PipelineId) -> Result<Pipeline, RoutineflowError>;

    /// Deletes a pipeline that owns no routines.
    async fn delete_pipeline(&self, id: PipelineId) -> Result<(), RoutineflowError>;

    /// Creates a routine, plus the edge `previous -> new` when `previous`
    /// is given, in one atomic write.
    async fn insert_routine(
        &self,
        pipeline_id: PipelineId,
        spec: RoutineSpec,
        previous: Option<RoutineId>,
    ) -> Result<Routine, RoutineflowError>;

    /// Loads a routine.
    async fn get_routine(&self, id: RoutineId) -> Result<Routine, RoutineflowError>;

    /// Applies `mutation` atomically and returns the committed change.
    async fn update_routine(
        &self,
        id: RoutineId,
        mutation: RoutineMutation,
    ) -> Result<RoutineChange, RoutineflowError>;

    /// Deletes a routine that no edge references.
    async fn delete_routine(&self, id: RoutineId) -> Result<(), RoutineflowError>;

    /// Links two routines of the same pipeline.
    async fn add_edge(&self, edge: RoutineEdge) -> Result<(), RoutineflowError>;

    /// Routines of a pipeline, ordered by id.
    async fn routines(&self, pipeline_id: PipelineId) -> Result<Vec<Routine>, RoutineflowError>;

    /// Edges of a pipeline, in creation order.
    async fn edges(&self, pipeline_id: PipelineId) -> Result<Vec<RoutineEdge>, RoutineflowError>;

    /// Targets of the routine's outgoing edges.
    async fn next_routines(&self, id: RoutineId) -> Result<Vec<Routine>, RoutineflowError>;

    /// Sources of the routine's incoming edges.
    async fn dependent_routines(&self, id: RoutineId) -> Result<Vec<Routine>, RoutineflowError>;

    /// Routines with no incoming edge.
    async fn roots(&self, pipeline_id: PipelineId) -> Result<Vec<Routine>, RoutineflowError> {
        let edges = self.edges(pipeline_id).await?;
        let targets: HashSet<RoutineId> = edges.iter().map(|e| e.next_routine_id).collect();
        Ok(self
            .routines(pipeline_id)
            .await?
            .into_iter()
            .filter(|routine| !targets.contains(&routine.id))
            .collect())
    }

    /// Routines with no outgoing edge.
    async fn leaves(&self, pipeline_id: PipelineId) -> Result<Vec<Routine>, RoutineflowError> {
        let edges = self.edges(pipeline_id).await?;
        let sources: HashSet<RoutineId> = edges.iter().map(|e| e.routine_id).collect();
        Ok(self
            .routines(pipeline_id)
            .await?
            .into_iter()
            .filter(|routine| !sources.contains(&routine.id))
            .collect())
    }
}

/// Checks a mutated row against the row it replaces.
///
/// # Errors
///
/// Returns `InvalidTransition` for a forbidden status change,
/// `ConstraintViolation` when `attempt_count` exceeds `max_retries` and
/// `Internal` when an immutable column changed.
pub fn validate_write(previous: &Routine, current: &Routine) -> Result<(), RoutineflowError> {
    if current.id != previous.id || current.pipeline_id != previous.pipeline_id {
        return Err(RoutineflowError::Internal(format!(
            "Routine #{} cannot change its id or pipeline",
            previous.id
        )));
    }
    ensure_transition(previous.status, current.status)?;
    current.check_constraints()
}
