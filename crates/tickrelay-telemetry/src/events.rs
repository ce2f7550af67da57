//! Leveled observability events.
//!
//! Every connector state transition and every dispatch outcome produces one
//! `ObservabilityEvent`. Sinks decide where they go: the tracing log, a
//! broadcast channel feeding a UI, or an in-memory buffer for tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

/// Event severity as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    pub id: Uuid,
    pub level: EventLevel,
    /// Emitting component (`feed`, `batch.primary`, `dispatch`, ...).
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, Value>,
    pub at: DateTime<Utc>,
}

impl ObservabilityEvent {
    pub fn new(level: EventLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            source: source.into(),
            message: message.into(),
            detail: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, source, message)
    }

    pub fn success(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Success, source, message)
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Warning, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, source, message)
    }

    /// Attach a detail field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.detail.get(key)
    }
}

/// Destination for observability events.
///
/// `emit` must not block: it is called from the connector driver and from
/// the dispatch path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObservabilityEvent);
}

/// Shared, type-erased sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Writes every event to the tracing log at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ObservabilityEvent) {
        let detail = serde_json::to_string(&event.detail).unwrap_or_default();
        match event.level {
            EventLevel::Info | EventLevel::Success => {
                info!(source = %event.source, level = %event.level, %detail, "{}", event.message)
            }
            EventLevel::Warning => {
                warn!(source = %event.source, %detail, "{}", event.message)
            }
            EventLevel::Error => {
                error!(source = %event.source, %detail, "{}", event.message)
            }
        }
    }
}

/// Fans events out to any number of subscribers (e.g. a UI websocket).
///
/// Events emitted with no subscriber attached are discarded.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ObservabilityEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ObservabilityEvent) {
        match self.tx.send(event) {
            Ok(n) => trace!(receivers = n, "Event broadcast"),
            Err(_) => trace!("No event subscribers connected"),
        }
    }
}

/// Keeps every event in memory. Handy for tests and for a status endpoint.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ObservabilityEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ObservabilityEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder_and_serialization() {
        let event = ObservabilityEvent::warning("dispatch", "Backing off")
            .with_detail("retry_after_ms", 3000)
            .with_detail("status", 503);

        assert_eq!(event.level, EventLevel::Warning);
        assert_eq!(event.detail("status"), Some(&Value::from(503)));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["detail"]["retry_after_ms"], 3000);
    }

    #[test]
    fn test_empty_detail_is_omitted() {
        let event = ObservabilityEvent::info("feed", "Connecting");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_memory_sink_matching() {
        let sink = MemorySink::new();
        sink.emit(ObservabilityEvent::info("feed", "Connected"));
        sink.emit(ObservabilityEvent::error("feed", "Reconnect attempts exhausted"));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.matching("exhausted").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.emit(ObservabilityEvent::success("dispatch", "Batch delivered"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.level, EventLevel::Success);
        assert_eq!(received.message, "Batch delivered");
    }

    #[test]
    fn test_broadcast_sink_without_subscribers_does_not_panic() {
        let sink = BroadcastSink::new(4);
        sink.emit(ObservabilityEvent::info("feed", "nobody listening"));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.emit(ObservabilityEvent::info("feed", "hello"));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
