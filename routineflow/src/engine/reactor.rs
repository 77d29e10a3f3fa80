//! Side effects of committed status changes.
//!
//! Runs after the write that caused it has committed, so anything it
//! pushes or cascades observes the new status.

use super::{routine, Engine};
use crate::core::RoutineStatus;
use crate::errors::RoutineflowError;
use crate::queue::TaskTarget;
use crate::store::RoutineChange;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) async fn react(engine: &Engine, change: &RoutineChange) -> Result<(), RoutineflowError> {
    let routine = &change.current;
    match routine.status {
        RoutineStatus::Completed => {
            let pipeline = engine.store().get_pipeline(routine.pipeline_id).await?;
            if pipeline.is_reverting() {
                info!(
                    routine_id = %routine.id,
                    pipeline_id = %pipeline.id,
                    "Routine #{} completed after its pipeline started reverting", routine.id
                );
                engine.write_routine(routine.id, routine::revert()).await?;
                Ok(())
            } else {
                enqueue_ready_next(engine, change).await
            }
        }
        RoutineStatus::Reverted | RoutineStatus::Aborted => revert_dependents(engine, change).await,
        RoutineStatus::Scheduled => {
            let delay = if change.previous.status == RoutineStatus::Failed {
                engine.config().retry_backoff.delay_for(routine.attempt_count)
            } else {
                Duration::ZERO
            };
            engine
                .queue()
                .push_task(TaskTarget::Dispatcher, routine.id, delay)
                .await?;
            Ok(())
        }
        RoutineStatus::Reverting => {
            engine
                .queue()
                .push_task(TaskTarget::Reverter, routine.id, Duration::ZERO)
                .await?;
            Ok(())
        }
        RoutineStatus::Pending | RoutineStatus::Running | RoutineStatus::Failed => Ok(()),
    }
}

// A next routine joins all of its upstream routines: it is enqueued by
// whichever upstream completion commits last.
async fn enqueue_ready_next(engine: &Engine, change: &RoutineChange) -> Result<(), RoutineflowError> {
    let store = engine.store();
    for next in store.next_routines(change.current.id).await? {
        if next.status != RoutineStatus::Pending {
            continue;
        }
        let upstream = store.dependent_routines(next.id).await?;
        if let Some(waiting) = upstream
            .iter()
            .find(|routine| routine.status != RoutineStatus::Completed)
        {
            debug!(
                routine_id = %next.id,
                waiting_on = %waiting.id,
                "Next routine still waits on an upstream routine"
            );
            continue;
        }
        engine.write_routine(next.id, routine::enqueue_pending()).await?;
    }
    Ok(())
}

async fn revert_dependents(engine: &Engine, change: &RoutineChange) -> Result<(), RoutineflowError> {
    let mut first_error = None;
    for dependent in engine.store().dependent_routines(change.current.id).await? {
        match engine
            .write_routine(dependent.id, routine::revert_unless_running())
            .await
        {
            Ok(routine) if routine.status == RoutineStatus::Running => {
                debug!(
                    routine_id = %routine.id,
                    reverted_by = %change.current.id,
                    "Dependent routine is running, reverting it once the attempt ends"
                );
                engine
                    .store()
                    .mark_pipeline_reverting(routine.pipeline_id)
                    .await?;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    routine_id = %dependent.id,
                    reverted_by = %change.current.id,
                    error = %err,
                    "Could not revert dependent routine"
                );
                first_error.get_or_insert(err);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
