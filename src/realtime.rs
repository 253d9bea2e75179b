//! Shared realtime channel.
//!
//! One broadcast fan-out carries every live message: event-log inserts,
//! handler outcomes, session blocks, system errors. WebSocket clients
//! subscribe at `/ws`; internal services publish without holding any
//! reference to their consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RealtimeBus {
    tx: broadcast::Sender<RealtimeMessage>,
}

impl Default for RealtimeBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl RealtimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a message to all current subscribers. Messages sent with no
    /// subscribers are dropped; that is fine for a live stream.
    pub fn broadcast(&self, topic: &str, kind: &str, payload: serde_json::Value) {
        let message = RealtimeMessage {
            topic: topic.to_string(),
            kind: kind.to_string(),
            payload,
            ts: Utc::now(),
        };
        let _ = self.tx.send(message);
    }

    /// Structured error on the shared `system` topic.
    pub fn broadcast_error(&self, code: &str, message: &str, status_code: u16) {
        self.broadcast(
            "system",
            "error",
            serde_json::json!({
                "code": code,
                "message": message,
                "statusCode": status_code,
            }),
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let bus = RealtimeBus::new();
        let mut rx = bus.subscribe();
        bus.broadcast("events/logs", "event_created", serde_json::json!({"id": "e1"}));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "events/logs");
        assert_eq!(message.kind, "event_created");
        assert_eq!(message.payload["id"], "e1");
    }

    #[tokio::test]
    async fn error_broadcast_carries_status() {
        let bus = RealtimeBus::new();
        let mut rx = bus.subscribe();
        bus.broadcast_error("MCP_NOT_CONFIGURED", "alias missing", 412);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "system");
        assert_eq!(message.payload["statusCode"], 412);
    }
}
