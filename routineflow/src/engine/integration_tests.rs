//! End-to-end tests driving pipelines through the local queue.

#[cfg(test)]
mod tests {
    use super::super::{routine, Delivery, DispatchOutcome, RevertOutcome};
    use crate::config::EngineConfig;
    use crate::core::{RoutineId, RoutineSpec, RoutineStatus};
    use crate::errors::{InvalidTransitionError, LockError, QueueError, RoutineflowError};
    use crate::events;
    use crate::locks::{dispatcher_lock_key, LockManager};
    use crate::queue::TaskTarget;
    use crate::tasks::FnTask;
    use crate::testing::{
        assert_all_reverted, assert_routine_completed, assert_routine_status, test_config,
        FailingTask, PanickingTask, RecordingTask, SlowTask, TestHarness,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn outcomes(deliveries: &[Delivery]) -> Vec<String> {
        deliveries
            .iter()
            .map(|delivery| {
                delivery.response.payload["result"]["outcome"]
                    .as_str()
                    .unwrap_or("<error>")
                    .to_string()
            })
            .collect()
    }

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    fn routine_body(id: RoutineId) -> Vec<u8> {
        serde_json::to_vec(&json!({ "routine_id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_linear_pipeline_retries_then_reverts_backwards() {
        let harness = TestHarness::new();
        let task_a = harness.register(RecordingTask::new("TaskA"));
        let task_b = harness.register(RecordingTask::new("TaskB").failing_times(2));
        let task_c = harness.register(RecordingTask::new("TaskC"));

        let pipeline = harness.pipeline("linear").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a
            .add_next(RoutineSpec::new("TaskB").with_max_retries(3))
            .await
            .unwrap();
        let c = b.add_next(RoutineSpec::new("TaskC")).await.unwrap();

        pipeline.start().await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(
            outcomes(&deliveries),
            vec!["completed", "failed", "failed", "completed", "completed"]
        );
        assert_eq!(
            harness.pushed(TaskTarget::Dispatcher),
            vec![a.id(), b.id(), b.id(), b.id(), c.id()]
        );
        assert_eq!(harness.push_count(TaskTarget::Dispatcher, c.id()), 1);

        let b_row = harness.routine(b.id()).await.unwrap();
        assert_routine_completed(&b_row);
        assert_eq!(b_row.attempt_count, 3);
        assert_eq!(task_b.run_count(), 3);
        assert_eq!(harness.events.events_of_type(events::TASK_FAILED).len(), 2);

        pipeline.revert().await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(outcomes(&deliveries), vec!["reverted", "reverted", "reverted"]);
        assert_eq!(
            harness.pushed(TaskTarget::Reverter),
            vec![c.id(), b.id(), a.id()]
        );
        assert_all_reverted(&pipeline.routines().await.unwrap());
        assert_eq!(task_c.reverts(), vec![Some(json!({"echo": {}}))]);
        assert_eq!(task_a.revert_count(), 1);
    }

    #[tokio::test]
    async fn test_status_changes_are_reported() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("SayHelloTask"));
        let pipeline = harness.pipeline("events").await.unwrap();
        let hello = pipeline
            .add_routine(RoutineSpec::new("SayHelloTask"))
            .await
            .unwrap();

        pipeline.start().await.unwrap();
        harness.run_until_idle().await.unwrap();

        let transitions: Vec<(Value, Value)> = harness
            .events
            .events_of_type(events::STATUS_CHANGED)
            .into_iter()
            .flatten()
            .map(|payload| {
                assert_eq!(payload["routine_id"], json!(hello.id()));
                (payload["from"].clone(), payload["to"].clone())
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (json!("pending"), json!("scheduled")),
                (json!("scheduled"), json!("running")),
                (json!("running"), json!("completed")),
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_routine_reverts_pipeline_once() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        harness.register(FailingTask::new("TaskB", "upstream unavailable"));

        let pipeline = harness.pipeline("exhaust").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a
            .add_next(RoutineSpec::new("TaskB").with_max_retries(2))
            .await
            .unwrap();

        pipeline.start().await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(
            outcomes(&deliveries),
            vec!["completed", "failed", "failed", "exhausted", "reverted", "reverted"]
        );
        assert_eq!(harness.push_count(TaskTarget::Reverter, b.id()), 1);
        assert_eq!(harness.push_count(TaskTarget::Reverter, a.id()), 1);
        assert_eq!(harness.events.events_of_type(events::RETRIES_EXHAUSTED).len(), 1);

        let b_row = harness.routine(b.id()).await.unwrap();
        assert_routine_status(&b_row, RoutineStatus::Reverted);
        assert_eq!(b_row.attempt_count, 2);
        assert_eq!(
            b_row.output,
            Some(json!({
                "error": format!("Routine #{} has exhausted retries and is being reverted", b.id())
            }))
        );
        assert_routine_status(&harness.routine(a.id()).await.unwrap(), RoutineStatus::Reverted);
    }

    #[tokio::test]
    async fn test_exhaustion_aborts_leaves_that_never_ran() {
        let harness = TestHarness::new();
        harness.register(FailingTask::new("TaskA", "bad input"));
        harness.register(RecordingTask::new("TaskB"));
        harness.register(RecordingTask::new("TaskC"));

        let pipeline = harness.pipeline("abort").await.unwrap();
        let a = pipeline
            .add_routine(RoutineSpec::new("TaskA").with_max_retries(1))
            .await
            .unwrap();
        let b = a.add_next(RoutineSpec::new("TaskB")).await.unwrap();
        let c = a.add_next(RoutineSpec::new("TaskC")).await.unwrap();

        pipeline.start().await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(outcomes(&deliveries), vec!["failed", "exhausted", "reverted"]);
        assert_eq!(harness.status(b.id()).await.unwrap(), RoutineStatus::Aborted);
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Aborted);
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Reverted);
        assert_eq!(harness.push_count(TaskTarget::Reverter, a.id()), 1);
        assert!(harness.pushed(TaskTarget::Reverter).iter().all(|id| *id == a.id()));
    }

    #[tokio::test]
    async fn test_sibling_running_during_exhaustion_is_reverted_when_it_completes() {
        let harness = TestHarness::new();
        let task_a = harness.register(RecordingTask::new("TaskA"));
        harness.register(FailingTask::new("TaskB", "service down"));
        let task_c = harness.register(RecordingTask::new("TaskC"));

        let pipeline = harness.pipeline("race").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a
            .add_next(RoutineSpec::new("TaskB").with_max_retries(1))
            .await
            .unwrap();
        let c = a.add_next(RoutineSpec::new("TaskC")).await.unwrap();

        pipeline.start().await.unwrap();
        let dispatcher = harness.engine.dispatcher();
        assert_eq!(dispatcher.process(a.id()).await.unwrap(), DispatchOutcome::Completed);
        harness
            .engine
            .write_routine(c.id(), routine::start_attempt())
            .await
            .unwrap();

        assert!(matches!(
            dispatcher.process(b.id()).await.unwrap(),
            DispatchOutcome::Failed { .. }
        ));
        assert_eq!(dispatcher.process(b.id()).await.unwrap(), DispatchOutcome::Exhausted);
        assert_eq!(harness.status(b.id()).await.unwrap(), RoutineStatus::Reverting);
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Running);
        assert!(harness.engine.pipeline(pipeline.id()).await.unwrap().pipeline().is_reverting());

        assert_eq!(dispatcher.process(c.id()).await.unwrap(), DispatchOutcome::Completed);
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Reverting);

        harness.run_until_idle().await.unwrap();

        for id in [a.id(), b.id(), c.id()] {
            assert_routine_status(&harness.routine(id).await.unwrap(), RoutineStatus::Reverted);
        }
        assert_eq!(task_c.revert_count(), 1);
        assert_eq!(task_c.reverts(), vec![Some(json!({"echo": {}}))]);
        assert_eq!(task_a.revert_count(), 1);
        assert_eq!(harness.push_count(TaskTarget::Reverter, a.id()), 1);
        assert_eq!(harness.push_count(TaskTarget::Reverter, c.id()), 1);
    }

    #[tokio::test]
    async fn test_sibling_failing_during_revert_is_not_retried() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        harness.register(FailingTask::new("TaskB", "service down"));
        harness.register(FailingTask::new("TaskC", "also down"));

        let pipeline = harness.pipeline("race").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a
            .add_next(RoutineSpec::new("TaskB").with_max_retries(1))
            .await
            .unwrap();
        let c = a
            .add_next(RoutineSpec::new("TaskC").with_max_retries(5))
            .await
            .unwrap();

        pipeline.start().await.unwrap();
        let dispatcher = harness.engine.dispatcher();
        dispatcher.process(a.id()).await.unwrap();
        harness
            .engine
            .write_routine(c.id(), routine::start_attempt())
            .await
            .unwrap();
        dispatcher.process(b.id()).await.unwrap();
        assert_eq!(dispatcher.process(b.id()).await.unwrap(), DispatchOutcome::Exhausted);

        let outcome = dispatcher.process(c.id()).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                error: "also down".to_string()
            }
        );
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Reverting);
        assert_eq!(harness.push_count(TaskTarget::Dispatcher, c.id()), 1);

        harness.run_until_idle().await.unwrap();
        for id in [a.id(), b.id(), c.id()] {
            assert_routine_status(&harness.routine(id).await.unwrap(), RoutineStatus::Reverted);
        }
    }

    #[tokio::test]
    async fn test_completion_enqueues_direct_next_routines_only() {
        let harness = TestHarness::new();
        for name in ["TaskA", "TaskB", "TaskC", "TaskD"] {
            harness.register(RecordingTask::new(name));
        }

        let pipeline = harness.pipeline("fan-out").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a.add_next(RoutineSpec::new("TaskB")).await.unwrap();
        let c = a.add_next(RoutineSpec::new("TaskC")).await.unwrap();
        let d = b.add_next(RoutineSpec::new("TaskD")).await.unwrap();

        pipeline.start().await.unwrap();
        let outcome = harness.engine.dispatcher().process(a.id()).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(harness.status(b.id()).await.unwrap(), RoutineStatus::Scheduled);
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Scheduled);
        assert_eq!(harness.status(d.id()).await.unwrap(), RoutineStatus::Pending);
        assert_eq!(
            harness.pushed(TaskTarget::Dispatcher),
            vec![a.id(), b.id(), c.id()]
        );
    }

    #[tokio::test]
    async fn test_join_waits_for_every_upstream_routine() {
        let harness = TestHarness::new();
        let joined = harness.register(RecordingTask::new("TaskC"));
        harness.register(RecordingTask::new("TaskA"));
        harness.register(RecordingTask::new("TaskB"));

        let pipeline = harness.pipeline("join").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = pipeline.add_routine(RoutineSpec::new("TaskB")).await.unwrap();
        let c = a.add_next(RoutineSpec::new("TaskC")).await.unwrap();
        b.add_edge(c.id()).await.unwrap();

        let started = pipeline.start().await.unwrap();
        assert_eq!(started.len(), 2);

        harness.engine.dispatcher().process(a.id()).await.unwrap();
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Pending);

        harness.run_until_idle().await.unwrap();
        assert_eq!(harness.status(c.id()).await.unwrap(), RoutineStatus::Completed);
        assert_eq!(harness.push_count(TaskTarget::Dispatcher, c.id()), 1);
        assert_eq!(joined.run_count(), 1);

        let mut handle = harness.engine.routine(c.id()).await.unwrap();
        handle.revert().await.unwrap();
        harness.run_until_idle().await.unwrap();

        assert_eq!(harness.pushed(TaskTarget::Reverter), vec![c.id(), a.id(), b.id()]);
        assert_all_reverted(&pipeline.routines().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_runs_task_once() {
        let harness = TestHarness::new();
        let task_a = harness.register(RecordingTask::new("TaskA"));
        harness.register(RecordingTask::new("TaskB"));

        let pipeline = harness.pipeline("at-least-once").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a.add_next(RoutineSpec::new("TaskB")).await.unwrap();

        pipeline.start().await.unwrap();
        harness.engine.redeliver(a.id()).await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(
            outcomes(&deliveries),
            vec!["completed", "already_completed", "completed"]
        );
        assert_eq!(task_a.run_count(), 1);
        assert_eq!(harness.push_count(TaskTarget::Dispatcher, b.id()), 1);

        let again = harness.engine.dispatcher().process(a.id()).await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyCompleted);
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_place_deliveries_are_skipped() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("skip").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        let dispatched = harness.engine.dispatcher().process(a.id()).await.unwrap();
        assert_eq!(
            dispatched,
            DispatchOutcome::Skipped {
                status: RoutineStatus::Pending
            }
        );

        pipeline.start().await.unwrap();
        harness.run_until_idle().await.unwrap();
        let reverted = harness.engine.reverter().process(a.id()).await.unwrap();
        assert_eq!(
            reverted,
            RevertOutcome::Skipped {
                status: RoutineStatus::Completed
            }
        );

        pipeline.revert().await.unwrap();
        harness.run_until_idle().await.unwrap();
        let reverted = harness.engine.reverter().process(a.id()).await.unwrap();
        assert_eq!(reverted, RevertOutcome::AlreadyReverted);
    }

    #[tokio::test]
    async fn test_routine_left_running_is_picked_up_again() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("crash").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        harness
            .engine
            .write_routine(a.id(), routine::enqueue())
            .await
            .unwrap();
        harness
            .engine
            .write_routine(a.id(), routine::start_attempt())
            .await
            .unwrap();

        let outcome = harness.engine.dispatcher().process(a.id()).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(harness.routine(a.id()).await.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_runs_task_once() {
        let harness = TestHarness::new();
        let task = harness.register(SlowTask::with_delay_ms("SlowTask", 50));
        let pipeline = harness.pipeline("mutex").await.unwrap();
        let slow = pipeline.add_routine(RoutineSpec::new("SlowTask")).await.unwrap();
        pipeline.start().await.unwrap();

        let dispatcher = harness.engine.dispatcher();
        let (first, second) = tokio::join!(dispatcher.process(slow.id()), dispatcher.process(slow.id()));
        let results = [first, second];

        let completed = results
            .iter()
            .filter(|result| matches!(result, Ok(DispatchOutcome::Completed)))
            .count();
        let timed_out = results
            .iter()
            .filter(|result| matches!(result, Err(RoutineflowError::Lock(LockError::Timeout { .. }))))
            .count();
        assert_eq!((completed, timed_out), (1, 1));
        assert_eq!(task.run_count(), 1);
        assert_eq!(task.max_in_flight(), 1);
        assert_eq!(harness.status(slow.id()).await.unwrap(), RoutineStatus::Completed);
    }

    #[tokio::test]
    async fn test_busy_lock_answers_service_unavailable_and_is_redelivered() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("busy").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        pipeline.start().await.unwrap();

        let locks = harness.engine.locks();
        let held = locks
            .acquire(&dispatcher_lock_key(a.id()), Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let response = harness
            .engine
            .endpoint()
            .handle(TaskTarget::Dispatcher.task_name(), &routine_body(a.id()), &no_headers())
            .await;
        assert_eq!(response.status, 503);

        let deliveries = harness.run_until_idle().await.unwrap();
        assert_eq!(deliveries.len(), 4);
        assert!(deliveries.iter().all(|delivery| delivery.response.status == 503));
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Scheduled);

        assert!(locks.release(&held).await.unwrap());
        harness.engine.redeliver(a.id()).await.unwrap();
        harness.run_until_idle().await.unwrap();
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("transitions").await.unwrap();
        let mut a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        let err = a.complete(json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            RoutineflowError::InvalidTransition(ref e)
                if *e == InvalidTransitionError::new(RoutineStatus::Pending, RoutineStatus::Completed)
        ));
        assert_eq!(
            err.to_string(),
            "Status update from 'pending' to 'completed' is not allowed"
        );

        a.enqueue().await.unwrap();
        harness
            .engine
            .write_routine(a.id(), routine::start_attempt())
            .await
            .unwrap();
        a.refresh().await.unwrap();
        let err = a.revert().await.unwrap_err();
        assert!(matches!(
            err,
            RoutineflowError::InvalidTransition(ref e)
                if *e == InvalidTransitionError::new(RoutineStatus::Running, RoutineStatus::Reverting)
        ));
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Running);
        assert!(harness.pushed(TaskTarget::Reverter).is_empty());
    }

    #[tokio::test]
    async fn test_attempts_cannot_exceed_max_retries() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("constraint").await.unwrap();
        let a = pipeline
            .add_routine(RoutineSpec::new("TaskA").with_max_retries(1))
            .await
            .unwrap();

        let engine = &harness.engine;
        engine.write_routine(a.id(), routine::enqueue()).await.unwrap();
        engine.write_routine(a.id(), routine::start_attempt()).await.unwrap();
        engine
            .write_routine(a.id(), routine::finish(RoutineStatus::Failed, json!({"error": "boom"})))
            .await
            .unwrap();
        engine.write_routine(a.id(), routine::enqueue()).await.unwrap();

        let err = engine
            .write_routine(a.id(), routine::start_attempt())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoutineflowError::ConstraintViolation { routine_id, .. } if routine_id == a.id()
        ));

        let row = harness.routine(a.id()).await.unwrap();
        assert_eq!(row.attempt_count, 1);
        assert_routine_status(&row, RoutineStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_referenced_records_cannot_be_deleted() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("protected").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a.add_next(RoutineSpec::new("TaskA")).await.unwrap();
        let lonely = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        let err = harness.engine.delete_pipeline(pipeline.id()).await.unwrap_err();
        assert!(matches!(err, RoutineflowError::ProtectedRecord { .. }));
        for id in [a.id(), b.id()] {
            let err = harness.engine.delete_routine(id).await.unwrap_err();
            assert!(matches!(err, RoutineflowError::ProtectedRecord { .. }));
        }

        harness.engine.delete_routine(lonely.id()).await.unwrap();
        assert!(matches!(
            harness.engine.routine(lonely.id()).await.unwrap_err(),
            RoutineflowError::RoutineNotFound(id) if id == lonely.id()
        ));
    }

    #[tokio::test]
    async fn test_graph_validation() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("graph").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        let b = a.add_next(RoutineSpec::new("TaskA")).await.unwrap();

        let err = b.add_edge(a.id()).await.unwrap_err();
        assert!(matches!(err, RoutineflowError::InvalidEdge { .. }));

        let err = pipeline
            .add_routine(RoutineSpec::new("MissingTask"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Task MissingTask not registered.");
        assert_eq!(pipeline.edges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_queue_falls_back_to_backup() {
        let harness =
            TestHarness::with_config(test_config().with_backup_queue("tests", "tests-backup"));
        harness.register(RecordingTask::new("TaskA"));
        harness.queue.mark_deleted("tests");

        let pipeline = harness.pipeline("backup").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        pipeline.start().await.unwrap();

        let history = harness.queue.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].queue, "tests-backup");

        harness.run_until_idle().await.unwrap();
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_push_is_recovered_by_redeliver() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        harness.queue.mark_deleted("tests");

        let pipeline = harness.pipeline("redeliver").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(
            err,
            RoutineflowError::Queue(QueueError::DeletedRecently { .. })
        ));
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Scheduled);
        assert!(harness.queue.is_empty());

        harness.queue.restore("tests");
        let receipt = harness.engine.redeliver(a.id()).await.unwrap().unwrap();
        assert_eq!(receipt.queue, "tests");

        harness.run_until_idle().await.unwrap();
        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Completed);
        assert_eq!(harness.engine.redeliver(a.id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded_as_failure() {
        let harness = TestHarness::new();
        harness.register(PanickingTask::new("BoomTask"));
        let pipeline = harness.pipeline("panic").await.unwrap();
        let boom = pipeline.add_routine(RoutineSpec::new("BoomTask")).await.unwrap();
        pipeline.start().await.unwrap();

        let dispatcher = harness.engine.dispatcher();
        let outcome = dispatcher.process(boom.id()).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                error: "BoomTask exploded".to_string()
            }
        );

        let row = harness.routine(boom.id()).await.unwrap();
        assert_routine_status(&row, RoutineStatus::Scheduled);
        assert_eq!(row.output, Some(json!({"error": "BoomTask exploded"})));

        // The lock was released, so the next attempt runs.
        let outcome = dispatcher.process(boom.id()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(harness.routine(boom.id()).await.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_failed_task_output_is_recorded() {
        let harness = TestHarness::new();
        harness.register(FailingTask::new("TaskA", "quota exceeded"));
        let pipeline = harness.pipeline("failed").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        pipeline.start().await.unwrap();

        let events_before = harness.events.len();
        let delivery = harness.worker.deliver_next().await.unwrap().unwrap();
        assert_eq!(delivery.response.payload["result"]["error"], json!("quota exceeded"));

        let failures = harness.events.events_of_type(events::TASK_FAILED);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].as_ref().unwrap()["error"], json!("quota exceeded"));
        assert!(harness.events.len() > events_before);

        // The retry is queued but not yet delivered.
        let row = harness.routine(a.id()).await.unwrap();
        assert_routine_status(&row, RoutineStatus::Scheduled);
        assert_eq!(row.output, Some(json!({"error": "quota exceeded"})));
        assert_eq!(harness.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_revert_halts_until_redelivered() {
        let harness = TestHarness::new();
        let task = harness.register(RecordingTask::new("TaskA").failing_revert("cannot undo"));
        let pipeline = harness.pipeline("halt").await.unwrap();
        let a = pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();

        pipeline.start().await.unwrap();
        harness.run_until_idle().await.unwrap();
        pipeline.revert().await.unwrap();
        let deliveries = harness.run_until_idle().await.unwrap();

        assert_eq!(outcomes(&deliveries), vec!["halted"]);
        let row = harness.routine(a.id()).await.unwrap();
        assert_routine_status(&row, RoutineStatus::Reverting);
        assert_eq!(row.output, Some(json!({"echo": {}})));
        assert_eq!(harness.events.events_of_type(events::REVERT_FAILED).len(), 1);

        task.heal_revert();
        harness.engine.redeliver(a.id()).await.unwrap();
        harness.run_until_idle().await.unwrap();

        assert_eq!(harness.status(a.id()).await.unwrap(), RoutineStatus::Reverted);
        assert_eq!(task.revert_count(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_routing() {
        let harness = TestHarness::new();
        harness.register(RecordingTask::new("TaskA"));
        harness.engine.registry().register_on_demand(Arc::new(FnTask::new(
            "SayHelloTask",
            |body| async move { Ok(json!({ "hello": body.get("name").cloned().unwrap_or(Value::Null) })) },
        )));
        let endpoint = harness.engine.endpoint();

        let response = endpoint
            .handle("SayHelloTask", br#"{"name": "Ada"}"#, &no_headers())
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.payload, json!({"result": {"hello": "Ada"}}));

        let response = endpoint.handle("SayHelloTask", b"  ", &no_headers()).await;
        assert_eq!(response.payload, json!({"result": {"hello": null}}));

        for body in [&b"[1, 2]"[..], &b"not json"[..]] {
            let response = endpoint.handle("SayHelloTask", body, &no_headers()).await;
            assert_eq!(response.status, 400);
        }
        let response = endpoint.handle("SayHelloTask", b"[1, 2]", &no_headers()).await;
        assert_eq!(
            response.payload["error"],
            json!("Invalid task body: expected a JSON object, got [1,2]")
        );

        let response = endpoint
            .handle(TaskTarget::Dispatcher.task_name(), b"{}", &no_headers())
            .await;
        assert_eq!(response.status, 400);

        let response = endpoint
            .handle(TaskTarget::Dispatcher.task_name(), &routine_body(RoutineId(999)), &no_headers())
            .await;
        assert_eq!(response.status, 500);
        assert_eq!(response.payload, json!({"error": "Routine #999 not found"}));

        let headers = HashMap::from([(
            "x-cloudtasks-taskretrycount".to_string(),
            "many".to_string(),
        )]);
        let response = endpoint.handle("SayHelloTask", b"{}", &headers).await;
        assert_eq!(response.status, 400);

        for unknown in ["NoSuchTask", "TaskA"] {
            let response = endpoint.handle(unknown, b"{}", &no_headers()).await;
            assert_eq!(response.status, 404);
            assert_eq!(
                response.payload,
                json!({
                    "error": format!("Task {unknown} not found"),
                    "available_tasks": [
                        "PipelineRoutineRevertTask",
                        "PipelineRoutineTask",
                        "SayHelloTask",
                    ],
                })
            );
        }
    }

    #[tokio::test]
    async fn test_engine_from_json_config() {
        let config = EngineConfig::from_json_str(
            r#"{"app_name": "billing", "domain": "https://jobs.example.com"}"#,
        )
        .unwrap();
        let harness = TestHarness::with_config(config);
        harness.register(RecordingTask::new("TaskA"));
        let pipeline = harness.pipeline("configured").await.unwrap();
        pipeline.add_routine(RoutineSpec::new("TaskA")).await.unwrap();
        pipeline.start().await.unwrap();

        let message = &harness.queue.history()[0];
        assert_eq!(message.queue, "billing");
        assert!(message.name.starts_with("billing"));
        assert!(message.url.starts_with("https://jobs.example.com"));
        assert!(message.url.ends_with("PipelineRoutineTask"));
    }
}
