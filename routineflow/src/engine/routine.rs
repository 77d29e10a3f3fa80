//! Node-level operations.

use super::Engine;
use crate::core::{Routine, RoutineEdge, RoutineId, RoutineSpec, RoutineStatus};
use crate::errors::RoutineflowError;
use crate::store::RoutineMutation;
use chrono::Utc;
use serde_json::Value;

/// A routine bound to the engine that persists it.
///
/// The wrapped row is a snapshot refreshed by every operation. Decisions
/// are always taken against the persisted row inside the store's atomic
/// section, never against the snapshot.
#[derive(Debug, Clone)]
pub struct RoutineHandle {
    engine: Engine,
    routine: Routine,
}

impl RoutineHandle {
    pub(crate) fn new(engine: Engine, routine: Routine) -> Self {
        Self { engine, routine }
    }

    /// Routine id.
    #[must_use]
    pub fn id(&self) -> RoutineId {
        self.routine.id
    }

    /// Status as of the last operation or refresh.
    #[must_use]
    pub fn status(&self) -> RoutineStatus {
        self.routine.status
    }

    /// The row as of the last operation or refresh.
    #[must_use]
    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    /// Consumes the handle and returns the row.
    #[must_use]
    pub fn into_routine(self) -> Routine {
        self.routine
    }

    /// Reloads the row from the store.
    pub async fn refresh(&mut self) -> Result<&Routine, RoutineflowError> {
        self.routine = self.engine.store().get_routine(self.routine.id).await?;
        Ok(&self.routine)
    }

    async fn write(&mut self, mutation: RoutineMutation) -> Result<&Routine, RoutineflowError> {
        self.routine = self.engine.write_routine(self.routine.id, mutation).await?;
        Ok(&self.routine)
    }

    /// Schedules the routine; the dispatcher message is pushed once the
    /// write commits.
    pub async fn enqueue(&mut self) -> Result<&Routine, RoutineflowError> {
        self.write(enqueue()).await
    }

    /// Marks the routine failed with `output`.
    pub async fn fail(&mut self, output: Value) -> Result<&Routine, RoutineflowError> {
        self.write(finish(RoutineStatus::Failed, output)).await
    }

    /// Marks the routine completed with `output`; ready next routines are
    /// enqueued once the write commits.
    pub async fn complete(&mut self, output: Value) -> Result<&Routine, RoutineflowError> {
        self.write(finish(RoutineStatus::Completed, output)).await
    }

    /// Starts compensating the routine.
    ///
    /// Already reverted, reverting or aborted routines are left alone; a
    /// routine that never left PENDING is aborted instead of reverted.
    pub async fn revert(&mut self) -> Result<&Routine, RoutineflowError> {
        self.write(revert()).await
    }

    /// Creates a routine in the same pipeline that runs after this one.
    pub async fn add_next(&self, spec: RoutineSpec) -> Result<RoutineHandle, RoutineflowError> {
        self.engine.registry().get_routine_task(&spec.task_name)?;
        let routine = self
            .engine
            .store()
            .insert_routine(self.routine.pipeline_id, spec, Some(self.routine.id))
            .await?;
        Ok(Self::new(self.engine.clone(), routine))
    }

    /// Makes an existing routine run after this one.
    pub async fn add_edge(&self, next_routine_id: RoutineId) -> Result<(), RoutineflowError> {
        self.engine
            .store()
            .add_edge(RoutineEdge::new(self.routine.id, next_routine_id))
            .await
    }

    /// Routines that run after this one.
    pub async fn next_routines(&self) -> Result<Vec<Routine>, RoutineflowError> {
        self.engine.store().next_routines(self.routine.id).await
    }

    /// Routines this one runs after.
    pub async fn dependent_routines(&self) -> Result<Vec<Routine>, RoutineflowError> {
        self.engine.store().dependent_routines(self.routine.id).await
    }
}

pub(crate) fn enqueue() -> RoutineMutation {
    Box::new(|routine| {
        routine.status = RoutineStatus::Scheduled;
        routine.starts_at = Some(Utc::now());
        Ok(())
    })
}

/// Enqueues only a routine still waiting to run.
pub(crate) fn enqueue_pending() -> RoutineMutation {
    Box::new(|routine| {
        if routine.status == RoutineStatus::Pending {
            routine.status = RoutineStatus::Scheduled;
            routine.starts_at = Some(Utc::now());
        }
        Ok(())
    })
}

pub(crate) fn start_attempt() -> RoutineMutation {
    Box::new(|routine| {
        routine.attempt_count = routine.attempt_count.saturating_add(1);
        routine.status = RoutineStatus::Running;
        Ok(())
    })
}

pub(crate) fn finish(status: RoutineStatus, output: Value) -> RoutineMutation {
    Box::new(move |routine| {
        routine.status = status;
        routine.output = Some(output);
        routine.ends_at = Some(Utc::now());
        Ok(())
    })
}

pub(crate) fn revert() -> RoutineMutation {
    Box::new(|routine| {
        routine.status = revert_target(routine.status);
        Ok(())
    })
}

/// Revert used by cascades. A routine in the middle of an attempt is left
/// RUNNING; its pipeline's reverting marker reverts it when the attempt ends.
pub(crate) fn revert_unless_running() -> RoutineMutation {
    Box::new(|routine| {
        if routine.status != RoutineStatus::Running {
            routine.status = revert_target(routine.status);
        }
        Ok(())
    })
}

fn revert_target(status: RoutineStatus) -> RoutineStatus {
    match status {
        RoutineStatus::Reverted | RoutineStatus::Reverting | RoutineStatus::Aborted => status,
        RoutineStatus::Pending => RoutineStatus::Aborted,
        _ => RoutineStatus::Reverting,
    }
}

pub(crate) fn mark_reverted() -> RoutineMutation {
    Box::new(|routine| {
        routine.status = RoutineStatus::Reverted;
        Ok(())
    })
}
