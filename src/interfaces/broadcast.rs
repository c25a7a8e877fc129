//! Broadcast channel — fire-and-forget event publication.
//!
//! Progress events, failure alerts, and teaching progress all flow through
//! one channel with at-most-once delivery to zero or more live
//! subscribers. `publish` must never block or fail on subscriber absence:
//! a send error (no receivers) is logged at trace level and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Default bound on in-flight events per subscriber.
const CHANNEL_CAPACITY: usize = 256;

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Dotted event type, e.g. "run.progress", "failure.alert".
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns immediately whether or not anyone is
    /// listening.
    pub fn publish(&self, event_type: &str, payload: Value) {
        let event = EngineEvent {
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            log::trace!("event '{}' published with no subscribers", event_type);
        }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let channel = EventChannel::new();
        channel.publish("run.progress", json!({"done": 1}));
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let channel = EventChannel::new();
        let mut rx = channel.subscribe();
        channel.publish("failure.alert", json!({"pattern": "wrong_tool"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "failure.alert");
        assert_eq!(event.payload["pattern"], "wrong_tool");
    }
}
