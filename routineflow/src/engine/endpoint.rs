//! Delivery endpoint for queue messages.

use super::Engine;
use crate::core::RoutineBody;
use crate::errors::RoutineflowError;
use crate::queue::{LocalTaskQueue, QueueMessage, RoutinePayload, TaskMetadata, TaskTarget};
use crate::tasks::TaskKind;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP-style answer to a delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointResponse {
    /// Status code.
    pub status: u16,
    /// JSON body.
    pub payload: Value,
}

impl EndpointResponse {
    fn ok(result: Value) -> Self {
        Self {
            status: 200,
            payload: json!({ "result": result }),
        }
    }

    fn error(status: u16, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            payload: json!({ "error": message.to_string() }),
        }
    }

    /// Returns true for a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Routes delivered messages to the dispatcher, the reverter or an
/// on-demand task.
#[derive(Debug, Clone)]
pub struct TaskEndpoint {
    engine: Engine,
}

impl TaskEndpoint {
    /// Creates an endpoint bound to `engine`.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Names this endpoint accepts, sorted.
    #[must_use]
    pub fn available_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = TaskTarget::ALL
            .iter()
            .map(|target| target.task_name().to_string())
            .chain(self.engine.registry().list(TaskKind::OnDemand))
            .collect();
        names.sort();
        names
    }

    /// Handles one delivery of `task_name` with a raw JSON body.
    ///
    /// 404 for unknown tasks, 400 for malformed headers or bodies, 503 for
    /// transient engine errors that a redelivery may fix, 500 otherwise.
    pub async fn handle(
        &self,
        task_name: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> EndpointResponse {
        let metadata = match TaskMetadata::from_headers(headers) {
            Ok(metadata) => metadata,
            Err(err) => return EndpointResponse::error(400, err),
        };
        debug!(
            task_name,
            queue = metadata.queue_name.as_deref().unwrap_or_default(),
            retry_count = metadata.retry_count,
            "Task delivered"
        );

        let body = match parse_body(body) {
            Ok(body) => body,
            Err(err) => return EndpointResponse::error(400, err),
        };

        if let Some(target) = TaskTarget::from_task_name(task_name) {
            return self.handle_target(target, body).await;
        }

        match self.engine.registry().get(task_name) {
            Some(registered) if registered.kind == TaskKind::OnDemand => {
                match registered.task.run(&body).await {
                    Ok(output) => EndpointResponse::ok(output),
                    Err(err) => {
                        warn!(task_name, error = %err, "On-demand task failed");
                        EndpointResponse::error(500, err)
                    }
                }
            }
            _ => EndpointResponse {
                status: 404,
                payload: json!({
                    "error": format!("Task {task_name} not found"),
                    "available_tasks": self.available_tasks(),
                }),
            },
        }
    }

    async fn handle_target(&self, target: TaskTarget, body: RoutineBody) -> EndpointResponse {
        let payload: RoutinePayload = match serde_json::from_value(Value::Object(body)) {
            Ok(payload) => payload,
            Err(err) => return EndpointResponse::error(400, err),
        };

        let outcome = match target {
            TaskTarget::Dispatcher => self
                .engine
                .dispatcher()
                .process(payload.routine_id)
                .await
                .and_then(|outcome| Ok(serde_json::to_value(outcome)?)),
            TaskTarget::Reverter => self
                .engine
                .reverter()
                .process(payload.routine_id)
                .await
                .and_then(|outcome| Ok(serde_json::to_value(outcome)?)),
        };

        match outcome {
            Ok(result) => EndpointResponse::ok(result),
            Err(err) if err.is_transient() => {
                warn!(%target, routine_id = %payload.routine_id, error = %err, "Delivery failed, awaiting redelivery");
                EndpointResponse::error(503, err)
            }
            Err(err) => {
                warn!(%target, routine_id = %payload.routine_id, error = %err, "Delivery failed");
                EndpointResponse::error(500, err)
            }
        }
    }
}

fn parse_body(body: &[u8]) -> Result<RoutineBody, RoutineflowError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RoutineBody::new());
    }
    match serde_json::from_slice(body)? {
        Value::Object(map) => Ok(map),
        other => Err(RoutineflowError::InvalidBody(other.to_string())),
    }
}

/// One message handed to the endpoint by a [`LocalWorker`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The delivered message.
    pub message: QueueMessage,
    /// The endpoint's answer.
    pub response: EndpointResponse,
}

/// Drains a [`LocalTaskQueue`] through a [`TaskEndpoint`].
///
/// Deliveries answered with a 5xx status go back on the queue, up to
/// `max_redeliveries` times per message.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    queue: Arc<LocalTaskQueue>,
    endpoint: TaskEndpoint,
    max_redeliveries: u32,
    max_deliveries: usize,
}

impl LocalWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(queue: Arc<LocalTaskQueue>, endpoint: TaskEndpoint) -> Self {
        Self {
            queue,
            endpoint,
            max_redeliveries: 3,
            max_deliveries: 1_000,
        }
    }

    /// Sets how often a failed delivery is retried.
    #[must_use]
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Caps the deliveries made by one [`run_until_idle`](Self::run_until_idle).
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: usize) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Delivers the oldest pending message, if any.
    pub async fn deliver_next(&self) -> Result<Option<Delivery>, RoutineflowError> {
        let Some(message) = self.queue.pop() else {
            return Ok(None);
        };
        self.deliver(message, 0).await.map(Some)
    }

    async fn deliver(&self, message: QueueMessage, retry_count: u32) -> Result<Delivery, RoutineflowError> {
        let metadata = TaskMetadata {
            queue_name: Some(message.queue.clone()),
            task_name: Some(message.name.clone()),
            retry_count,
            execution_count: retry_count,
            eta: chrono::Duration::from_std(message.delay)
                .ok()
                .map(|delay| Utc::now() + delay),
            previous_response: None,
            retry_reason: None,
        };
        let body = serde_json::to_vec(&message.payload)?;
        let response = self
            .endpoint
            .handle(&message.task_name, &body, &metadata.to_headers())
            .await;
        Ok(Delivery { message, response })
    }

    /// Delivers messages until the queue is empty or the delivery cap is
    /// reached, and returns every delivery in order.
    pub async fn run_until_idle(&self) -> Result<Vec<Delivery>, RoutineflowError> {
        let mut deliveries = Vec::new();
        let mut retries: HashMap<String, u32> = HashMap::new();

        while deliveries.len() < self.max_deliveries {
            let Some(message) = self.queue.pop() else {
                return Ok(deliveries);
            };

            let retry_count = retries.get(&message.name).copied().unwrap_or(0);
            let delivery = self.deliver(message, retry_count).await?;

            if delivery.response.status >= 500 && retry_count < self.max_redeliveries {
                retries.insert(delivery.message.name.clone(), retry_count + 1);
                self.queue.requeue(delivery.message.clone());
            }
            deliveries.push(delivery);
        }

        if !self.queue.is_empty() {
            warn!(
                max_deliveries = self.max_deliveries,
                pending = self.queue.len(),
                "Delivery cap reached, leaving messages queued"
            );
        }
        Ok(deliveries)
    }
}
