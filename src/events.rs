//! Observable status events.
//!
//! Every component reports what it is doing through an [`EventSink`]. Outside
//! observers (a websocket, a log shipper, a test) subscribe and receive
//! [`WatchEvent`]s. The sink is a broadcast channel: sending never blocks, and a
//! slow subscriber loses the oldest events instead of stalling the watch.
//!
//! ```
//! use email_dispatch::events::{EventKind, EventSink};
//!
//! let sink = EventSink::new(32);
//! let mut events = sink.subscribe();
//!
//! sink.emit(EventKind::Login, "Connected");
//!
//! let event = events.try_recv().unwrap();
//! assert_eq!(event.msg_type, EventKind::Login);
//! assert_eq!(event.data, "Connected");
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Which part of the engine produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Connecting, authenticating, selecting, logging out.
    Login,
    /// Change notifier state.
    Idle,
    /// Fetching and decoding messages.
    Fetch,
    /// Rule evaluation.
    Extract,
    /// Callback delivery.
    Delivery,
    /// Watch loop transitions.
    Watch,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Login => write!(f, "login"),
            EventKind::Idle => write!(f, "idle"),
            EventKind::Fetch => write!(f, "fetch"),
            EventKind::Extract => write!(f, "extract"),
            EventKind::Delivery => write!(f, "delivery"),
            EventKind::Watch => write!(f, "watch"),
        }
    }
}

/// One human-readable status line.
#[derive(Debug, Clone, Serialize)]
pub struct WatchEvent {
    /// Producer of the event.
    pub msg_type: EventKind,
    /// Status text.
    pub data: String,
    /// When the event was emitted.
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
}

/// Write-only, lossy fan-in channel for [`WatchEvent`]s.
///
/// Cloning the sink is cheap; all clones feed the same subscribers.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<WatchEvent>,
}

impl EventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. Never blocks; dropped when nobody listens.
    pub fn emit(&self, msg_type: EventKind, data: impl Into<String>) {
        let event = WatchEvent {
            msg_type,
            data: data.into(),
            timestamp: Utc::now(),
        };
        tracing::debug!(msg_type = %event.msg_type, data = %event.data, "watch event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        let sink = EventSink::new(4);
        sink.emit(EventKind::Watch, "nobody listens");
    }

    #[test]
    fn test_slow_subscriber_loses_oldest() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();

        sink.emit(EventKind::Fetch, "one");
        sink.emit(EventKind::Fetch, "two");
        sink.emit(EventKind::Fetch, "three");

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert_eq!(rx.try_recv().unwrap().data, "two");
        assert_eq!(rx.try_recv().unwrap().data, "three");
    }

    #[test]
    fn test_event_serializes_like_socket_message() {
        let sink = EventSink::new(1);
        let mut rx = sink.subscribe();
        sink.emit(EventKind::Delivery, "ok");

        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"msg_type": "delivery", "data": "ok"}));
    }
}
