//! Task registry for resolving task names.

use super::{RoutineTask, TaskKind};
use crate::errors::RoutineflowError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A task together with the way it may be used.
#[derive(Clone)]
pub struct RegisteredTask {
    /// The task implementation.
    pub task: Arc<dyn RoutineTask>,
    /// How the task may be used.
    pub kind: TaskKind,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.task.name())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Registry mapping task names to implementations.
///
/// Registering a name twice replaces the earlier entry.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, RegisteredTask>>,
}

impl TaskRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task that can back routines.
    pub fn register(&self, task: Arc<dyn RoutineTask>) {
        self.insert(task, TaskKind::Routine);
    }

    /// Registers a task delivered directly to the endpoint.
    pub fn register_on_demand(&self, task: Arc<dyn RoutineTask>) {
        self.insert(task, TaskKind::OnDemand);
    }

    fn insert(&self, task: Arc<dyn RoutineTask>, kind: TaskKind) {
        let name = task.name().to_string();
        self.tasks.write().insert(name, RegisteredTask { task, kind });
    }

    /// Gets a task by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RegisteredTask> {
        self.tasks.read().get(name).cloned()
    }

    /// Resolves a task that can back a routine.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown names and `TaskKindMismatch` for
    /// on-demand tasks.
    pub fn get_routine_task(&self, name: &str) -> Result<Arc<dyn RoutineTask>, RoutineflowError> {
        match self.get(name) {
            Some(RegisteredTask {
                task,
                kind: TaskKind::Routine,
            }) => Ok(task),
            Some(RegisteredTask { kind, .. }) => Err(RoutineflowError::TaskKindMismatch {
                name: name.to_string(),
                kind: kind.to_string(),
            }),
            None => Err(RoutineflowError::task_not_found(name)),
        }
    }

    /// Checks if a task is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }

    /// Lists registered task names of the given kind, sorted.
    #[must_use]
    pub fn list(&self, kind: TaskKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, registered)| registered.kind == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.tasks.read();
        let routine_count = tasks
            .values()
            .filter(|registered| registered.kind == TaskKind::Routine)
            .count();
        f.debug_struct("TaskRegistry")
            .field("routine_count", &routine_count)
            .field("on_demand_count", &(tasks.len() - routine_count))
            .finish()
    }
}
