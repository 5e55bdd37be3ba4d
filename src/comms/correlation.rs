//! Correlated request/response over a client channel.
//!
//! Tool logic running inside the gateway sometimes needs data that only the
//! client holds (memories, reminders, workspace state). The bus sends a
//! typed request envelope carrying a fresh `request_id`, then suspends the
//! caller until the matching `*_response` arrives, the 15s bound elapses,
//! or the client disconnects, whichever comes first.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::comms::{CommandError, PendingTable};
use crate::session::{send_value, ChannelSink};

pub struct CorrelationBus {
    pending: PendingTable,
    timeout: Duration,
}

impl CorrelationBus {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: PendingTable::new(),
            timeout,
        }
    }

    fn envelope(command_type: &str, action: &str, data: &Value, request_id: &str) -> Value {
        json!({
            "type": command_type,
            "action": action,
            "data": data,
            "request_id": request_id,
        })
    }

    /// Fire-and-forget: send the command envelope without a request slot.
    /// Used when the caller does not need a reply.
    pub fn notify(
        &self,
        channel: Option<Arc<dyn ChannelSink>>,
        client_id: Uuid,
        command_type: &str,
        action: &str,
        data: Value,
    ) -> Result<(), CommandError> {
        let channel = channel.ok_or(CommandError::NoConnection(client_id))?;
        let request_id = Uuid::new_v4().to_string();
        let envelope = Self::envelope(command_type, action, &data, &request_id);
        send_value(&channel, &envelope)
            .map_err(|_| CommandError::Channel("send failed".to_string()))
    }

    /// Send a command and await its response within the configured bound.
    ///
    /// The request slot is registered before transmission, so a response
    /// that races the caller onto the executor still finds its slot.
    pub async fn request(
        &self,
        channel: Option<Arc<dyn ChannelSink>>,
        client_id: Uuid,
        command_type: &str,
        action: &str,
        data: Value,
    ) -> Result<Value, CommandError> {
        let channel = channel.ok_or(CommandError::NoConnection(client_id))?;
        let request_id = Uuid::new_v4().to_string();
        let rx = self.pending.register(client_id, &request_id);

        let envelope = Self::envelope(command_type, action, &data, &request_id);
        if send_value(&channel, &envelope).is_err() {
            self.pending.discard(client_id, &request_id);
            return Err(CommandError::Channel("send failed".to_string()));
        }

        debug!(
            client_id = %client_id,
            request_id = %request_id,
            command_type,
            action,
            "Awaiting command response"
        );

        match timeout(self.timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped without resolution: the client disconnected.
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.pending.discard(client_id, &request_id);
                warn!(
                    client_id = %client_id,
                    request_id = %request_id,
                    command_type,
                    "Command timed out"
                );
                Err(CommandError::Timeout)
            }
        }
    }

    /// Deliver a response envelope to its waiting slot. Returns false when
    /// no slot matched (late or unsolicited response).
    pub fn resolve(&self, client_id: Uuid, request_id: &str, payload: Value) -> bool {
        self.pending.resolve(client_id, request_id, payload)
    }

    /// Drop all outstanding slots for a disconnecting client, waking their
    /// waiters with [`CommandError::Disconnected`].
    pub fn cancel_client(&self, client_id: Uuid) {
        let cancelled = self.pending.cancel_client(client_id);
        if cancelled > 0 {
            debug!(
                client_id = %client_id,
                cancelled,
                "Cancelled pending commands on disconnect"
            );
        }
    }

    pub fn pending_for(&self, client_id: Uuid) -> usize {
        self.pending.count_for(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_channel() -> (Arc<dyn ChannelSink>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        (Arc::new(tx), rx)
    }

    #[tokio::test]
    async fn test_request_fails_fast_without_connection() {
        let bus = CorrelationBus::new(Duration::from_secs(15));
        let client = Uuid::new_v4();
        let err = bus
            .request(None, client, "memory_request", "list", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NoConnection(client));
        assert_eq!(bus.pending_for(client), 0);
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_response() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(5)));
        let client = Uuid::new_v4();
        let (channel, mut rx) = test_channel();

        let request = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request(
                    Some(channel),
                    client,
                    "memory_request",
                    "list",
                    json!({ "limit": 5 }),
                )
                .await
            })
        };

        // Read the transmitted envelope and answer it.
        let frame = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope["type"], "memory_request");
        assert_eq!(envelope["action"], "list");
        let request_id = envelope["request_id"].as_str().unwrap();

        assert!(bus.resolve(client, request_id, json!({ "memories": [] })));

        let result = request.await.unwrap().unwrap();
        assert_eq!(result["memories"], json!([]));
        assert_eq!(bus.pending_for(client), 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_late_response_is_dropped() {
        let bus = CorrelationBus::new(Duration::from_millis(20));
        let client = Uuid::new_v4();
        let (channel, mut rx) = test_channel();

        let err = bus
            .request(Some(channel), client, "reminder_request", "list", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);

        // The late response finds no slot and is reported undelivered.
        let frame = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_str(&frame).unwrap();
        let request_id = envelope["request_id"].as_str().unwrap();
        assert!(!bus.resolve(client, request_id, json!({ "late": true })));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_request() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(30)));
        let client = Uuid::new_v4();
        let (channel, _rx) = test_channel();

        let request = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request(Some(channel), client, "memory_request", "get", json!({}))
                    .await
            })
        };

        // Give the request a chance to register its slot.
        tokio::task::yield_now().await;
        while bus.pending_for(client) == 0 {
            tokio::task::yield_now().await;
        }
        bus.cancel_client(client);

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err, CommandError::Disconnected);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let bus = CorrelationBus::new(Duration::from_secs(5));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let _rx_a = bus.pending.register(alice, "r1");
        let _rx_b = bus.pending.register(bob, "r1");

        // Same request id under a different client does not cross over.
        assert!(bus.resolve(alice, "r1", json!({ "for": "alice" })));
        assert_eq!(bus.pending_for(alice), 0);
        assert_eq!(bus.pending_for(bob), 1);
    }

    #[test]
    fn test_notify_requires_connection() {
        let bus = CorrelationBus::new(Duration::from_secs(5));
        let client = Uuid::new_v4();
        assert!(matches!(
            bus.notify(None, client, "memory_request", "clear", json!({})),
            Err(CommandError::NoConnection(_))
        ));

        let (channel, mut rx) = {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            (Arc::new(tx) as Arc<dyn ChannelSink>, rx)
        };
        bus.notify(Some(channel), client, "memory_request", "clear", json!({}))
            .unwrap();
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("\"memory_request\""));
        // No slot was left behind for a fire-and-forget notify.
        assert_eq!(bus.pending_for(client), 0);
    }
}
