//! The task trait and a closure-backed implementation.

use crate::core::RoutineBody;
use crate::errors::TaskError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// How a registered task may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Backs routines; run by the dispatcher, compensated by the reverter.
    Routine,
    /// Delivered directly to the task endpoint by name.
    OnDemand,
}

impl TaskKind {
    /// The lowercase name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work with a compensating action.
///
/// `run` receives the routine body; `revert` receives the output recorded
/// by the last completion. Both may fail; failures are recorded on the
/// routine and never escape the dispatcher or the reverter.
#[async_trait]
pub trait RoutineTask: Send + Sync {
    /// The name the task is registered under.
    fn name(&self) -> &str;

    /// Runs the forward action.
    async fn run(&self, body: &RoutineBody) -> Result<Value, TaskError>;

    /// Runs the compensating action.
    async fn revert(&self, data: Option<&Value>) -> Result<Value, TaskError>;
}

/// Boxed future returned by [`FnTask`] closures.
pub type TaskFuture = BoxFuture<'static, Result<Value, TaskError>>;

type RunFn = Arc<dyn Fn(RoutineBody) -> TaskFuture + Send + Sync>;
type RevertFn = Arc<dyn Fn(Option<Value>) -> TaskFuture + Send + Sync>;

/// A task built from closures.
///
/// Without a revert closure the compensating action does nothing and
/// returns `null`.
#[derive(Clone)]
pub struct FnTask {
    name: String,
    run: RunFn,
    revert: Option<RevertFn>,
}

impl FnTask {
    /// Creates a task from its forward action.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(RoutineBody) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |body| run(body).boxed()),
            revert: None,
        }
    }

    /// Sets the compensating action.
    #[must_use]
    pub fn with_revert<F, Fut>(mut self, revert: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.revert = Some(Arc::new(move |data| revert(data).boxed()));
        self
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("name", &self.name)
            .field("has_revert", &self.revert.is_some())
            .finish()
    }
}

#[async_trait]
impl RoutineTask for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, body: &RoutineBody) -> Result<Value, TaskError> {
        (self.run)(body.clone()).await
    }

    async fn revert(&self, data: Option<&Value>) -> Result<Value, TaskError> {
        match &self.revert {
            Some(revert) => revert(data.cloned()).await,
            None => Ok(Value::Null),
        }
    }
}
