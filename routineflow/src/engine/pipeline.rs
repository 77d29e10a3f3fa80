//! Pipeline-level operations.

use super::{routine, Engine, RoutineHandle};
use crate::core::{Pipeline, PipelineId, Routine, RoutineEdge, RoutineSpec, RoutineStatus};
use crate::errors::RoutineflowError;
use tracing::{debug, info, warn};

/// A pipeline bound to the engine that persists it.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    engine: Engine,
    pipeline: Pipeline,
}

impl PipelineHandle {
    pub(crate) fn new(engine: Engine, pipeline: Pipeline) -> Self {
        Self { engine, pipeline }
    }

    /// Pipeline id.
    #[must_use]
    pub fn id(&self) -> PipelineId {
        self.pipeline.id
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    /// The pipeline row.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Enqueues every pending routine with no incoming edge.
    ///
    /// Returns the routines that were scheduled.
    pub async fn start(&self) -> Result<Vec<Routine>, RoutineflowError> {
        let roots = self.engine.store().roots(self.pipeline.id).await?;
        let mut scheduled = Vec::new();
        for root in roots {
            if root.status != RoutineStatus::Pending {
                continue;
            }
            let mut handle = RoutineHandle::new(self.engine.clone(), root);
            handle.enqueue().await?;
            scheduled.push(handle.into_routine());
        }
        info!(pipeline_id = %self.pipeline.id, roots = scheduled.len(), "Pipeline started");
        Ok(scheduled)
    }

    /// Marks the pipeline as reverting, then reverts every routine with no
    /// outgoing edge.
    ///
    /// A leaf that is RUNNING is left to finish its attempt and is reverted
    /// when that attempt ends. Every leaf is attempted; the first error, if
    /// any, is returned after all of them were processed.
    pub async fn revert(&self) -> Result<(), RoutineflowError> {
        let pipeline = self
            .engine
            .store()
            .mark_pipeline_reverting(self.pipeline.id)
            .await?;
        let leaves = self.engine.store().leaves(pipeline.id).await?;
        info!(pipeline_id = %pipeline.id, leaves = leaves.len(), "Pipeline is being reverted");

        let mut first_error = None;
        for leaf in leaves {
            if leaf.status == RoutineStatus::Reverted {
                continue;
            }
            match self
                .engine
                .write_routine(leaf.id, routine::revert_unless_running())
                .await
            {
                Ok(routine) if routine.status == RoutineStatus::Running => {
                    debug!(pipeline_id = %pipeline.id, routine_id = %routine.id, "Leaf routine is running, reverting it once the attempt ends");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(pipeline_id = %pipeline.id, routine_id = %leaf.id, error = %err, "Could not revert leaf routine");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Creates a pending routine in this pipeline.
    pub async fn add_routine(&self, spec: RoutineSpec) -> Result<RoutineHandle, RoutineflowError> {
        self.engine.registry().get_routine_task(&spec.task_name)?;
        let routine = self
            .engine
            .store()
            .insert_routine(self.pipeline.id, spec, None)
            .await?;
        Ok(RoutineHandle::new(self.engine.clone(), routine))
    }

    /// Routines of the pipeline, ordered by id.
    pub async fn routines(&self) -> Result<Vec<Routine>, RoutineflowError> {
        self.engine.store().routines(self.pipeline.id).await
    }

    /// Edges of the pipeline.
    pub async fn edges(&self) -> Result<Vec<RoutineEdge>, RoutineflowError> {
        self.engine.store().edges(self.pipeline.id).await
    }
}
