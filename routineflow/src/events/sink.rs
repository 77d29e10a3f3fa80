//! Where engine events go.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::{RETRIES_EXHAUSTED, REVERT_FAILED, TASK_FAILED};
use crate::core::RoutineId;

/// Receiver of engine events.
///
/// The engine only calls [`EventSink::try_emit`], from inside status
/// writes and deliveries, so implementations must not block and must not
/// fail.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event.
    fn try_emit(&self, event_type: &str, data: Option<Value>);

    /// Awaitable form of [`EventSink::try_emit`] for sinks that do I/O.
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }
}

/// Drops every event. The engine's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`.
///
/// Failures (task errors, exhausted retries, failed reverts) are logged at
/// WARN and everything else at DEBUG. The routine and pipeline ids of the
/// payload become span fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    /// Creates a logging sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn is_failure(event_type: &str) -> bool {
        matches!(event_type, TASK_FAILED | RETRIES_EXHAUSTED | REVERT_FAILED)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        let field = |name: &str| {
            data.as_ref()
                .and_then(|data| data.get(name))
                .and_then(Value::as_u64)
        };
        let routine_id = field("routine_id");
        let pipeline_id = field("pipeline_id");

        if Self::is_failure(event_type) {
            let error = data
                .as_ref()
                .and_then(|data| data.get("error"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            warn!(event_type, ?routine_id, ?pipeline_id, error, "Engine event {}", event_type);
        } else {
            debug!(event_type, ?routine_id, ?pipeline_id, event_data = ?data, "Engine event {}", event_type);
        }
    }
}

/// One event kept by a [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Event type, one of the constants in [`crate::events`].
    pub event_type: String,
    /// Payload as emitted.
    pub data: Option<Value>,
}

impl RecordedEvent {
    /// Routine the event is about, when the payload names one.
    #[must_use]
    pub fn routine_id(&self) -> Option<RoutineId> {
        self.data
            .as_ref()
            .and_then(|data| data.get("routine_id"))
            .and_then(Value::as_u64)
            .map(RoutineId)
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Number of events so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Payloads of the events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<Option<Value>> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type == event_type)
            .map(|event| event.data.clone())
            .collect()
    }

    /// Events about one routine.
    #[must_use]
    pub fn for_routine(&self, routine_id: RoutineId) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.routine_id() == Some(routine_id))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::STATUS_CHANGED;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_emit_delegates_to_try_emit() {
        let sink = CollectingEventSink::new();
        tokio_test::block_on(sink.emit(REVERT_FAILED, None));
        assert_eq!(sink.events_of_type(REVERT_FAILED), vec![None]);
    }

    #[test]
    fn test_logging_sink_accepts_any_payload() {
        let sink = LoggingEventSink::new();
        sink.try_emit(TASK_FAILED, Some(json!({"routine_id": 1, "error": "boom"})));
        sink.try_emit(STATUS_CHANGED, Some(json!(["not", "an", "object"])));
        sink.try_emit(STATUS_CHANGED, None);
        NoOpEventSink.try_emit(STATUS_CHANGED, None);
        assert!(LoggingEventSink::is_failure(RETRIES_EXHAUSTED));
        assert!(!LoggingEventSink::is_failure(STATUS_CHANGED));
    }

    #[test]
    fn test_collecting_sink_filters() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.try_emit(STATUS_CHANGED, Some(json!({"routine_id": 1})));
        sink.try_emit(TASK_FAILED, Some(json!({"routine_id": 2, "error": "boom"})));
        sink.try_emit(STATUS_CHANGED, Some(json!({"routine_id": 2})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events()[1].event_type, TASK_FAILED);
        assert_eq!(sink.events_of_type(STATUS_CHANGED).len(), 2);

        let second = sink.for_routine(RoutineId(2));
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|event| event.routine_id() == Some(RoutineId(2))));

        sink.clear();
        assert!(sink.is_empty());
    }
}
