//! Test assertions for routines.

use crate::core::{Routine, RoutineStatus};

/// Asserts that the routine has the expected status.
pub fn assert_routine_status(routine: &Routine, expected: RoutineStatus) {
    assert_eq!(
        routine.status, expected,
        "Expected routine #{} ({}) to be {}, got {}",
        routine.id, routine.task_name, expected, routine.status
    );
}

/// Asserts that the routine completed.
pub fn assert_routine_completed(routine: &Routine) {
    assert_routine_status(routine, RoutineStatus::Completed);
}

/// Asserts that the routine failed and recorded `message` as its error.
pub fn assert_routine_failed_with(routine: &Routine, message: &str) {
    assert_routine_status(routine, RoutineStatus::Failed);
    let recorded = routine
        .output
        .as_ref()
        .and_then(|output| output.get("error"))
        .and_then(serde_json::Value::as_str);
    assert_eq!(
        recorded,
        Some(message),
        "Expected routine #{} to record error {:?}, output was {:?}",
        routine.id,
        message,
        routine.output
    );
}

/// Asserts that every routine ended up reverted or aborted.
pub fn assert_all_reverted(routines: &[Routine]) {
    let pending: Vec<String> = routines
        .iter()
        .filter(|routine| !routine.status.is_reverted())
        .map(|routine| format!("#{} {}", routine.id, routine.status))
        .collect();
    assert!(
        pending.is_empty(),
        "Expected every routine to be reverted, still waiting on: {pending:?}"
    );
}
