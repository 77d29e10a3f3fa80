//! Routine records and the specs used to create them.

use super::{PipelineId, RoutineStatus};
use crate::errors::RoutineflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a routine, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutineId(pub u64);

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// JSON object used as a task's input.
pub type RoutineBody = serde_json::Map<String, serde_json::Value>;

/// One node of a pipeline DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    /// Unique identifier.
    pub id: RoutineId,
    /// Name of the registered task that runs this routine.
    pub task_name: String,
    /// Owning pipeline.
    pub pipeline_id: PipelineId,
    /// Input passed to the task's `run`.
    pub body: RoutineBody,
    /// Execution attempts made so far.
    pub attempt_count: u32,
    /// Ceiling for `attempt_count`; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Output of the last completion or failure.
    pub output: Option<serde_json::Value>,
    /// When the routine was last scheduled.
    pub starts_at: Option<DateTime<Utc>>,
    /// When the routine last completed or failed.
    pub ends_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RoutineStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Routine {
    /// Name of the retry ceiling check constraint.
    pub const MAX_RETRIES_CONSTRAINT: &'static str = "max_retries_less_than_attempt_count";

    /// Returns true if `max_retries` is set and has been reached.
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.max_retries
            .is_some_and(|max_retries| self.attempt_count >= max_retries)
    }

    /// Checks the row-level constraints enforced on every write.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` when `attempt_count` exceeds `max_retries`.
    pub fn check_constraints(&self) -> Result<(), RoutineflowError> {
        match self.max_retries {
            Some(max_retries) if max_retries < self.attempt_count => {
                Err(RoutineflowError::ConstraintViolation {
                    constraint: Self::MAX_RETRIES_CONSTRAINT,
                    routine_id: self.id,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Everything needed to create a routine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutineSpec {
    /// Registered task name.
    pub task_name: String,
    /// Task input.
    #[serde(default)]
    pub body: RoutineBody,
    /// Retry ceiling.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Initial attempt count; only non-zero when importing existing rows.
    #[serde(default)]
    pub attempt_count: u32,
    /// Initial status; anything other than pending is rejected.
    #[serde(default)]
    pub status: RoutineStatus,
}

impl RoutineSpec {
    /// Creates a spec for the given task with an empty body.
    #[must_use]
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Self::default()
        }
    }

    /// Sets the body from a JSON value; non-object values yield an empty body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = match body {
            serde_json::Value::Object(map) => map,
            _ => RoutineBody::new(),
        };
        self
    }

    /// Sets a single body entry.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the initial attempt count.
    #[must_use]
    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// Sets the initial status.
    #[must_use]
    pub fn with_status(mut self, status: RoutineStatus) -> Self {
        self.status = status;
        self
    }

    /// Builds the routine row for the given id and pipeline.
    #[must_use]
    pub fn into_routine(self, id: RoutineId, pipeline_id: PipelineId) -> Routine {
        let now = Utc::now();
        Routine {
            id,
            task_name: self.task_name,
            pipeline_id,
            body: self.body,
            attempt_count: self.attempt_count,
            max_retries: self.max_retries,
            output: None,
            starts_at: None,
            ends_at: None,
            status: self.status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine(max_retries: Option<u32>, attempt_count: u32) -> Routine {
        let mut routine = RoutineSpec::new("SayHelloTask")
            .with_attempt_count(attempt_count)
            .into_routine(RoutineId(1), PipelineId(1));
        routine.max_retries = max_retries;
        routine
    }

    #[test]
    fn test_retries_exhausted() {
        assert!(!routine(None, 10).retries_exhausted());
        assert!(!routine(Some(3), 2).retries_exhausted());
        assert!(routine(Some(3), 3).retries_exhausted());
        assert!(routine(Some(0), 0).retries_exhausted());
    }

    #[test]
    fn test_max_retries_constraint() {
        assert!(routine(Some(3), 3).check_constraints().is_ok());
        assert!(routine(None, 7).check_constraints().is_ok());

        let err = routine(Some(1), 5).check_constraints().unwrap_err();
        assert!(err
            .to_string()
            .contains("constraint failed: max_retries_less_than_attempt_count"));
    }

    #[test]
    fn test_spec_body_builders() {
        let spec = RoutineSpec::new("DummyRoutineTask")
            .with_body(serde_json::json!({"spell": "wingardium leviosa"}))
            .with_param("level", serde_json::json!(2));

        assert_eq!(spec.body.get("spell"), Some(&serde_json::json!("wingardium leviosa")));
        assert_eq!(spec.body.len(), 2);

        let ignored = RoutineSpec::new("x").with_body(serde_json::json!([1, 2]));
        assert!(ignored.body.is_empty());
    }

    #[test]
    fn test_spec_into_routine_defaults() {
        let routine = RoutineSpec::new("SayHelloTask").into_routine(RoutineId(7), PipelineId(2));
        assert_eq!(routine.status, RoutineStatus::Pending);
        assert_eq!(routine.attempt_count, 0);
        assert!(routine.output.is_none());
        assert!(routine.starts_at.is_none());
        assert_eq!(routine.pipeline_id, PipelineId(2));
    }
}
