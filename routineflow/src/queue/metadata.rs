//! Delivery metadata carried in queue request headers.

use crate::errors::RoutineflowError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const QUEUE_NAME: &str = "X-CloudTasks-QueueName";
const TASK_NAME: &str = "X-CloudTasks-TaskName";
const RETRY_COUNT: &str = "X-CloudTasks-TaskRetryCount";
const EXECUTION_COUNT: &str = "X-CloudTasks-TaskExecutionCount";
const ETA: &str = "X-CloudTasks-TaskETA";
const PREVIOUS_RESPONSE: &str = "X-CloudTasks-TaskPreviousResponse";
const RETRY_REASON: &str = "X-CloudTasks-TaskRetryReason";

/// What the queue tells a delivered task about its own delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Queue the message came from.
    pub queue_name: Option<String>,
    /// Queue-assigned message name.
    pub task_name: Option<String>,
    /// Deliveries that came before this one.
    pub retry_count: u32,
    /// Deliveries that got a response from the handler.
    pub execution_count: u32,
    /// Scheduled delivery time.
    pub eta: Option<DateTime<Utc>>,
    /// HTTP status of the previous delivery.
    pub previous_response: Option<String>,
    /// Why the previous delivery was retried.
    pub retry_reason: Option<String>,
}

impl TaskMetadata {
    /// Parses delivery headers; names are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` when a numeric header does not parse.
    pub fn from_headers(headers: &HashMap<String, String>) -> Result<Self, RoutineflowError> {
        let lookup: HashMap<String, &str> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();
        let get = |name: &str| lookup.get(&name.to_ascii_lowercase()).copied();

        let count = |name: &str| -> Result<u32, RoutineflowError> {
            get(name).map_or(Ok(0), |value| {
                value.trim().parse().map_err(|_| invalid(name, value))
            })
        };

        let eta = match get(ETA) {
            Some(value) => Some(parse_eta(value).ok_or_else(|| invalid(ETA, value))?),
            None => None,
        };

        Ok(Self {
            queue_name: get(QUEUE_NAME).map(str::to_string),
            task_name: get(TASK_NAME).map(str::to_string),
            retry_count: count(RETRY_COUNT)?,
            execution_count: count(EXECUTION_COUNT)?,
            eta,
            previous_response: get(PREVIOUS_RESPONSE).map(str::to_string),
            retry_reason: get(RETRY_REASON).map(str::to_string),
        })
    }

    /// Renders the metadata as delivery headers.
    #[must_use]
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(RETRY_COUNT.to_string(), self.retry_count.to_string());
        headers.insert(EXECUTION_COUNT.to_string(), self.execution_count.to_string());

        let optional = [
            (QUEUE_NAME, self.queue_name.clone()),
            (TASK_NAME, self.task_name.clone()),
            (ETA, self.eta.map(format_eta)),
            (PREVIOUS_RESPONSE, self.previous_response.clone()),
            (RETRY_REASON, self.retry_reason.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                headers.insert(name.to_string(), value);
            }
        }
        headers
    }

    /// Returns true on the first delivery of a message.
    #[must_use]
    pub fn is_first_attempt(&self) -> bool {
        self.retry_count == 0
    }
}

fn invalid(name: &str, value: &str) -> RoutineflowError {
    RoutineflowError::InvalidHeader {
        name: name.to_string(),
        value: value.to_string(),
    }
}

// ETA travels as fractional seconds since the epoch.
fn parse_eta(value: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
}

fn format_eta(eta: DateTime<Utc>) -> String {
    format!("{}.{:06}", eta.timestamp(), eta.timestamp_subsec_micros())
}
