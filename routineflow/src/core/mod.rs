//! Core domain model types for routineflow.
//!
//! This module contains the records the engine persists and the state
//! machine that constrains them:
//! - Routine status and the transition table
//! - Routine, pipeline and edge records
//! - Specs used to create routines

mod pipeline;
mod routine;
mod status;

pub use pipeline::{Pipeline, PipelineId, RoutineEdge};
pub use routine::{Routine, RoutineBody, RoutineId, RoutineSpec};
pub use status::{ensure_initial, ensure_transition, RoutineStatus};
