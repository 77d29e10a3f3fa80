//! Testing utilities for routineflow pipelines.
//!
//! This module provides:
//! - Mock tasks that record, fail, panic or sleep
//! - Assertions on routine rows
//! - A harness wiring an engine to an in-process queue and worker

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_all_reverted, assert_routine_completed, assert_routine_failed_with,
    assert_routine_status,
};
pub use fixtures::{test_config, TestHarness};
pub use mocks::{FailingTask, PanickingTask, RecordingTask, SlowTask};
