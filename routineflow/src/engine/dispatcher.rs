//! Runs one attempt of a routine's task.

use super::{routine, Engine, RoutineHandle};
use crate::core::{RoutineId, RoutineStatus};
use crate::errors::{RoutineflowError, TaskError};
use crate::events;
use crate::locks::dispatcher_lock_key;
use crate::observability::SpanTimer;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{info, warn};

/// What a dispatcher delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The routine had already completed; nothing ran.
    AlreadyCompleted,
    /// The routine was not waiting for the dispatcher; nothing ran.
    Skipped {
        /// The status found.
        status: RoutineStatus,
    },
    /// The routine ran out of attempts and its pipeline is being reverted.
    Exhausted,
    /// The task succeeded.
    Completed,
    /// The task failed. The routine was enqueued again, or reverted when
    /// its pipeline is reverting.
    Failed {
        /// The task's error message.
        error: String,
    },
}

/// Executes routines delivered by the queue.
#[derive(Debug, Clone)]
pub struct RoutineDispatcher {
    engine: Engine,
}

impl RoutineDispatcher {
    /// Creates a dispatcher bound to `engine`.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs one attempt of the routine under its dispatcher lock.
    ///
    /// Task failures are recorded on the routine and never returned.
    ///
    /// # Errors
    ///
    /// Returns `Lock` when the lock is busy past the wait window (safe to
    /// redeliver), `TaskNotFound` when the task is not registered, and
    /// any store or queue error.
    pub async fn process(&self, routine_id: RoutineId) -> Result<DispatchOutcome, RoutineflowError> {
        let settings = &self.engine.config().dispatcher_lock;
        let locks = self.engine.locks();
        let handle = locks
            .acquire(
                &dispatcher_lock_key(routine_id),
                settings.lease(),
                settings.wait(),
            )
            .await?;

        let result = self.process_locked(routine_id).await;

        if let Err(err) = locks.release(&handle).await {
            warn!(routine_id = %routine_id, error = %err, "Failed to release dispatcher lock");
        }
        result
    }

    async fn process_locked(&self, routine_id: RoutineId) -> Result<DispatchOutcome, RoutineflowError> {
        let routine = self.engine.store().get_routine(routine_id).await?;
        let pipeline_id = routine.pipeline_id;

        match routine.status {
            RoutineStatus::Completed => {
                info!(routine_id = %routine_id, "Routine #{} is already completed", routine_id);
                return Ok(DispatchOutcome::AlreadyCompleted);
            }
            RoutineStatus::Scheduled | RoutineStatus::Running => {}
            status => {
                warn!(routine_id = %routine_id, %status, "Routine #{} is {}, skipping dispatch", routine_id, status);
                return Ok(DispatchOutcome::Skipped { status });
            }
        }

        let mut handle = RoutineHandle::new(self.engine.clone(), routine);

        if handle.routine().retries_exhausted() {
            let message = format!("Routine #{routine_id} has exhausted retries and is being reverted");
            info!(
                routine_id = %routine_id,
                pipeline_id = %pipeline_id,
                attempt = handle.routine().attempt_count,
                "{}", message
            );
            handle.fail(json!({ "error": message })).await?;
            self.engine.events().try_emit(
                events::RETRIES_EXHAUSTED,
                Some(events::routine_error(handle.routine(), &message)),
            );
            self.engine.pipeline(pipeline_id).await?.revert().await?;
            return Ok(DispatchOutcome::Exhausted);
        }

        let task = self
            .engine
            .registry()
            .get_routine_task(&handle.routine().task_name)?;

        let routine = self
            .engine
            .write_routine(routine_id, routine::start_attempt())
            .await?;
        info!(
            routine_id = %routine_id,
            pipeline_id = %pipeline_id,
            task_name = %routine.task_name,
            attempt = routine.attempt_count,
            "Routine #{} is running", routine_id
        );

        let timer = SpanTimer::start(routine.task_name.as_str());
        let result = AssertUnwindSafe(task.run(&routine.body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::new(panic_message(panic))));
        let duration_ms = timer.finish();
        let mut handle = RoutineHandle::new(self.engine.clone(), routine);

        match result {
            Ok(output) => {
                handle.complete(output).await?;
                info!(routine_id = %routine_id, duration_ms, "Routine #{} just completed", routine_id);
                Ok(DispatchOutcome::Completed)
            }
            Err(err) => {
                info!(routine_id = %routine_id, duration_ms, error = %err, "Routine #{} has failed", routine_id);
                handle.fail(err.to_output()).await?;
                self.engine.events().try_emit(
                    events::TASK_FAILED,
                    Some(events::routine_error(handle.routine(), &err.message)),
                );
                if self.engine.store().get_pipeline(pipeline_id).await?.is_reverting() {
                    info!(
                        routine_id = %routine_id,
                        pipeline_id = %pipeline_id,
                        "Routine #{} failed after its pipeline started reverting", routine_id
                    );
                    handle.revert().await?;
                } else {
                    handle.enqueue().await?;
                    info!(
                        routine_id = %routine_id,
                        attempt = handle.routine().attempt_count,
                        "Routine #{} is being enqueued to retry", routine_id
                    );
                }
                Ok(DispatchOutcome::Failed { error: err.message })
            }
        }
    }
}

pub(super) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
