//! Task implementations and the registry that resolves them by name.
//!
//! Routines reference their task by `task_name`; the engine resolves the
//! name through a [`TaskRegistry`] populated explicitly at startup.

mod definitions;
mod registry;

pub use definitions::{FnTask, RoutineTask, TaskFuture, TaskKind};
pub use registry::{RegisteredTask, TaskRegistry};
