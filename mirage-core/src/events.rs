use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink storage failure: {0}")]
    Storage(String),
    #[error("all subscribers disconnected")]
    Disconnected,
}

/// Closed set of lifecycle payloads; one variant per wire `type` so fan-out
/// dispatch is exhaustive at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart {
        device: String,
        target_url: String,
        proxy: Option<String>,
    },
    Scroll {
        depth_pct: u8,
    },
    Click {
        url: String,
    },
    SessionEnd {
        success: bool,
        duration_s: f64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::SessionStart { .. } => "session_start",
            EventPayload::Scroll { .. } => "scroll",
            EventPayload::Click { .. } => "click",
            EventPayload::SessionEnd { .. } => "session_end",
            EventPayload::Error { .. } => "error",
        }
    }
}

/// One independent observer of the event stream. Delivery is synchronous
/// relative to `EventBus::emit`; sinks that need decoupling (live broadcast)
/// hand the event to a channel instead of doing work inline.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &SessionEvent) -> Result<(), SinkError>;
}

/// Fans each event out to every registered sink exactly once. A failing
/// sink is disconnected and removed; its failure never reaches the other
/// sinks or the emitting session.
#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn emit(&self, event: &SessionEvent) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|sink| match sink.deliver(event) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    sink = sink.name(),
                    kind = event.kind(),
                    error = %err,
                    "event sink failed, disconnecting it"
                );
                false
            }
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

/// Structured-log observer.
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, event: &SessionEvent) -> Result<(), SinkError> {
        info!(
            session_id = %event.session_id,
            kind = event.kind(),
            timestamp = %event.timestamp,
            "session event"
        );
        Ok(())
    }
}

/// Live-broadcast observer. Sending never blocks: slow subscribers lag on
/// their own receiver, and the sink only reports failure once every
/// subscriber is gone, at which point the bus disconnects it.
pub struct BroadcastSink {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: broadcast::Sender<SessionEvent>) -> Self {
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn deliver(&self, event: &SessionEvent) -> Result<(), SinkError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| SinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        name: &'static str,
        delivered: Arc<AtomicUsize>,
        fail: bool,
    }

    impl EventSink for CountingSink {
        fn name(&self) -> &str {
            self.name
        }

        fn deliver(&self, _event: &SessionEvent) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Storage("poisoned".into()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> SessionEvent {
        SessionEvent::new("s-1", EventPayload::Scroll { depth_pct: 40 })
    }

    #[test]
    fn failing_sink_is_isolated_and_removed() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        bus.register(Box::new(CountingSink {
            name: "first",
            delivered: Arc::clone(&first),
            fail: false,
        }));
        bus.register(Box::new(CountingSink {
            name: "second",
            delivered: Arc::new(AtomicUsize::new(0)),
            fail: true,
        }));
        bus.register(Box::new(CountingSink {
            name: "third",
            delivered: Arc::clone(&third),
            fail: false,
        }));

        for _ in 0..3 {
            bus.emit(&event());
        }

        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(third.load(Ordering::SeqCst), 3);
        assert_eq!(bus.sink_count(), 2);
    }

    #[test]
    fn broadcast_sink_disconnects_when_last_receiver_drops() {
        let (sink, receiver) = BroadcastSink::new(16);
        let bus = EventBus::new();
        bus.register(Box::new(sink));

        bus.emit(&event());
        assert_eq!(bus.sink_count(), 1);

        drop(receiver);
        bus.emit(&event());
        assert_eq!(bus.sink_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let (sink, mut receiver) = BroadcastSink::new(16);
        let bus = EventBus::new();
        bus.register(Box::new(sink));

        let emitted = event();
        bus.emit(&emitted);
        let received = receiver.recv().await.unwrap();
        assert_eq!(received, emitted);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["type"], "scroll");
        assert_eq!(json["depth_pct"], 40);
        assert_eq!(json["session_id"], "s-1");

        let end = SessionEvent::new(
            "s-1",
            EventPayload::SessionEnd {
                success: true,
                duration_s: 4.2,
            },
        );
        assert_eq!(end.kind(), "session_end");
        let round: SessionEvent =
            serde_json::from_value(serde_json::to_value(&end).unwrap()).unwrap();
        assert_eq!(round, end);
    }
}
