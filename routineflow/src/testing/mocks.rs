//! Mock tasks for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::RoutineBody;
use crate::errors::TaskError;
use crate::tasks::RoutineTask;

/// A task that records every call.
///
/// `run` returns the configured output, or `{"echo": body}` when none is
/// set. It can be told to fail a number of times before succeeding, and
/// its compensating action can be made to fail.
#[derive(Debug)]
pub struct RecordingTask {
    name: String,
    output: Mutex<Option<Value>>,
    failures_left: AtomicUsize,
    revert_error: Mutex<Option<String>>,
    runs: Mutex<Vec<RoutineBody>>,
    reverts: Mutex<Vec<Option<Value>>>,
}

impl RecordingTask {
    /// Creates a task that always succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(None),
            failures_left: AtomicUsize::new(0),
            revert_error: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
            reverts: Mutex::new(Vec::new()),
        }
    }

    /// Sets the output returned on success.
    #[must_use]
    pub fn with_output(self, output: Value) -> Self {
        *self.output.lock() = Some(output);
        self
    }

    /// Fails the first `times` runs.
    #[must_use]
    pub fn failing_times(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Makes every revert fail with `message`.
    #[must_use]
    pub fn failing_revert(self, message: impl Into<String>) -> Self {
        *self.revert_error.lock() = Some(message.into());
        self
    }

    /// Lets reverts succeed again.
    pub fn heal_revert(&self) {
        *self.revert_error.lock() = None;
    }

    /// Number of runs so far.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    /// Bodies passed to `run`, in call order.
    #[must_use]
    pub fn runs(&self) -> Vec<RoutineBody> {
        self.runs.lock().clone()
    }

    /// Number of reverts so far.
    #[must_use]
    pub fn revert_count(&self) -> usize {
        self.reverts.lock().len()
    }

    /// Data passed to `revert`, in call order.
    #[must_use]
    pub fn reverts(&self) -> Vec<Option<Value>> {
        self.reverts.lock().clone()
    }
}

#[async_trait]
impl RoutineTask for RecordingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, body: &RoutineBody) -> Result<Value, TaskError> {
        let attempt = {
            let mut runs = self.runs.lock();
            runs.push(body.clone());
            runs.len()
        };

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TaskError::new(format!("{} failed on attempt {attempt}", self.name)));
        }

        Ok(self
            .output
            .lock()
            .clone()
            .unwrap_or_else(|| json!({ "echo": body })))
    }

    async fn revert(&self, data: Option<&Value>) -> Result<Value, TaskError> {
        self.reverts.lock().push(data.cloned());
        match self.revert_error.lock().clone() {
            Some(message) => Err(TaskError::new(message)),
            None => Ok(json!({ "reverted": self.name })),
        }
    }
}

/// A task whose `run` always fails.
#[derive(Debug)]
pub struct FailingTask {
    name: String,
    error: String,
}

impl FailingTask {
    /// Creates a failing task.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl RoutineTask for FailingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _body: &RoutineBody) -> Result<Value, TaskError> {
        Err(TaskError::new(self.error.clone()))
    }

    async fn revert(&self, _data: Option<&Value>) -> Result<Value, TaskError> {
        Ok(Value::Null)
    }
}

/// A task that panics in `run`.
#[derive(Debug)]
pub struct PanickingTask {
    name: String,
}

impl PanickingTask {
    /// Creates a panicking task.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl RoutineTask for PanickingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _body: &RoutineBody) -> Result<Value, TaskError> {
        panic!("{} exploded", self.name);
    }

    async fn revert(&self, _data: Option<&Value>) -> Result<Value, TaskError> {
        Ok(Value::Null)
    }
}

/// A task that takes time to run and tracks overlapping runs.
#[derive(Debug)]
pub struct SlowTask {
    name: String,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    runs: AtomicUsize,
}

impl SlowTask {
    /// Creates a slow task.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    /// Creates a slow task with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }

    /// Number of runs started.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Highest number of runs seen at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutineTask for SlowTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _body: &RoutineBody) -> Result<Value, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "slept_ms": u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX) }))
    }

    async fn revert(&self, _data: Option<&Value>) -> Result<Value, TaskError> {
        Ok(Value::Null)
    }
}
