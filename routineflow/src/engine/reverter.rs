//! Runs a routine's compensating action.

use super::dispatcher::panic_message;
use super::{routine, Engine};
use crate::core::{RoutineId, RoutineStatus};
use crate::errors::{RoutineflowError, TaskError};
use crate::events;
use crate::locks::reverter_lock_key;
use crate::observability::SpanTimer;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use tracing::{error, info, warn};

/// What a reverter delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RevertOutcome {
    /// The routine had already been reverted; nothing ran.
    AlreadyReverted,
    /// The routine was not waiting for the reverter; nothing ran.
    Skipped {
        /// The status found.
        status: RoutineStatus,
    },
    /// The compensating action succeeded.
    Reverted,
    /// The compensating action failed; the routine stays reverting.
    Halted {
        /// The task's error message.
        error: String,
    },
}

/// Compensates routines delivered by the queue.
#[derive(Debug, Clone)]
pub struct RoutineReverter {
    engine: Engine,
}

impl RoutineReverter {
    /// Creates a reverter bound to `engine`.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs the routine's compensating action under its reverter lock.
    ///
    /// # Errors
    ///
    /// Returns `Lock` when the lock is busy past the wait window,
    /// `TaskNotFound` when the task is not registered, and any store or
    /// queue error raised while cascading.
    pub async fn process(&self, routine_id: RoutineId) -> Result<RevertOutcome, RoutineflowError> {
        let settings = &self.engine.config().reverter_lock;
        let locks = self.engine.locks();
        let handle = locks
            .acquire(
                &reverter_lock_key(routine_id),
                settings.lease(),
                settings.wait(),
            )
            .await?;

        let result = self.process_locked(routine_id).await;

        if let Err(err) = locks.release(&handle).await {
            warn!(routine_id = %routine_id, error = %err, "Failed to release reverter lock");
        }
        result
    }

    async fn process_locked(&self, routine_id: RoutineId) -> Result<RevertOutcome, RoutineflowError> {
        let routine = self.engine.store().get_routine(routine_id).await?;
        match routine.status {
            RoutineStatus::Reverted => {
                info!(routine_id = %routine_id, "Routine #{} is already reverted", routine_id);
                return Ok(RevertOutcome::AlreadyReverted);
            }
            RoutineStatus::Reverting => {}
            status => {
                warn!(routine_id = %routine_id, %status, "Routine #{} is {}, skipping revert", routine_id, status);
                return Ok(RevertOutcome::Skipped { status });
            }
        }

        let task = self.engine.registry().get_routine_task(&routine.task_name)?;
        info!(routine_id = %routine_id, task_name = %routine.task_name, "Routine #{} is being reverted", routine_id);

        let timer = SpanTimer::start(routine.task_name.as_str());
        let result = AssertUnwindSafe(task.revert(routine.output.as_ref()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::new(panic_message(panic))));
        let duration_ms = timer.finish();

        match result {
            Ok(_) => {
                self.engine
                    .write_routine(routine_id, routine::mark_reverted())
                    .await?;
                info!(routine_id = %routine_id, duration_ms, "Routine #{} just reverted", routine_id);
                Ok(RevertOutcome::Reverted)
            }
            Err(err) => {
                error!(
                    routine_id = %routine_id,
                    pipeline_id = %routine.pipeline_id,
                    duration_ms,
                    error = %err,
                    "Routine #{} failed to revert", routine_id
                );
                self.engine.events().try_emit(
                    events::REVERT_FAILED,
                    Some(events::routine_error(&routine, &err.message)),
                );
                Ok(RevertOutcome::Halted { error: err.message })
            }
        }
    }
}
