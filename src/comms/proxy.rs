//! Tool-proxy bridge: HTTP requests forwarded to a client's local tools.
//!
//! External callers POST a JSON-RPC style body to the tools endpoint; the
//! proxy wraps it in a `tool_request` envelope, sends it over the client's
//! channel, and awaits the `tool_response` within a 30s bound. Requests are
//! keyed by a fresh request id, so concurrent calls into the same namespace
//! do not collide.
//!
//! Notifications (`method` starting with `notification`) are fire-and-forget
//! per JSON-RPC: the envelope is sent and the HTTP caller gets an immediate
//! accepted status without waiting.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::comms::{CommandError, PendingTable};
use crate::session::{send_value, ChannelSink};

pub struct ToolProxy {
    pending: PendingTable,
    timeout: Duration,
}

impl ToolProxy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: PendingTable::new(),
            timeout,
        }
    }

    fn envelope(namespace: &str, data: &Value, request_id: &str) -> Value {
        json!({
            "type": "tool_request",
            "namespace": namespace,
            "data": data,
            "request_id": request_id,
        })
    }

    /// Forward a notification without awaiting any response.
    pub fn notify(
        &self,
        channel: Option<Arc<dyn ChannelSink>>,
        client_id: Uuid,
        namespace: &str,
        data: Value,
    ) -> Result<(), CommandError> {
        let channel = channel.ok_or(CommandError::NoConnection(client_id))?;
        let request_id = Uuid::new_v4().to_string();
        let envelope = Self::envelope(namespace, &data, &request_id);
        send_value(&channel, &envelope)
            .map_err(|_| CommandError::Channel("send failed".to_string()))
    }

    /// Forward a tool request and await its response.
    ///
    /// `Ok(None)` means the client answered with a null payload: the tool
    /// produced no response body, which the HTTP layer reports distinctly
    /// from a timeout.
    pub async fn request(
        &self,
        channel: Option<Arc<dyn ChannelSink>>,
        client_id: Uuid,
        namespace: &str,
        data: Value,
    ) -> Result<Option<Value>, CommandError> {
        let channel = channel.ok_or(CommandError::NoConnection(client_id))?;
        let request_id = Uuid::new_v4().to_string();
        let rx = self.pending.register(client_id, &request_id);

        let envelope = Self::envelope(namespace, &data, &request_id);
        if send_value(&channel, &envelope).is_err() {
            self.pending.discard(client_id, &request_id);
            return Err(CommandError::Channel("send failed".to_string()));
        }

        debug!(
            client_id = %client_id,
            request_id = %request_id,
            namespace,
            "Awaiting tool response"
        );

        match timeout(self.timeout, rx).await {
            Ok(Ok(Value::Null)) => Ok(None),
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.pending.discard(client_id, &request_id);
                warn!(
                    client_id = %client_id,
                    request_id = %request_id,
                    namespace,
                    "Tool request timed out"
                );
                Err(CommandError::Timeout)
            }
        }
    }

    /// Deliver the `data` field of a `tool_response` envelope to its slot.
    pub fn resolve(&self, client_id: Uuid, request_id: &str, data: Value) -> bool {
        self.pending.resolve(client_id, request_id, data)
    }

    pub fn cancel_client(&self, client_id: Uuid) {
        let cancelled = self.pending.cancel_client(client_id);
        if cancelled > 0 {
            debug!(
                client_id = %client_id,
                cancelled,
                "Cancelled pending tool requests on disconnect"
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
    async fn test_concurrent_requests_resolve_independently() {
        let proxy = Arc::new(ToolProxy::new(Duration::from_secs(5)));
        let client = Uuid::new_v4();
        let (channel, mut rx) = test_channel();

        let first = {
            let proxy = proxy.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                proxy
                    .request(Some(channel), client, "filesystem", json!({ "call": 1 }))
                    .await
            })
        };
        let second = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                proxy
                    .request(Some(channel), client, "filesystem", json!({ "call": 2 }))
                    .await
            })
        };

        let frame_a: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let frame_b: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame_a["type"], "tool_request");
        assert_ne!(frame_a["request_id"], frame_b["request_id"]);

        // Answer out of order; each waiter gets its own payload.
        let (for_two, for_one) = if frame_a["data"]["call"] == 1 {
            (&frame_b, &frame_a)
        } else {
            (&frame_a, &frame_b)
        };
        proxy.resolve(
            client,
            for_two["request_id"].as_str().unwrap(),
            json!({ "answer": 2 }),
        );
        proxy.resolve(
            client,
            for_one["request_id"].as_str().unwrap(),
            json!({ "answer": 1 }),
        );

        let one = first.await.unwrap().unwrap().unwrap();
        let two = second.await.unwrap().unwrap().unwrap();
        assert_eq!(one["answer"], 1);
        assert_eq!(two["answer"], 2);
    }

    #[tokio::test]
    async fn test_null_payload_means_no_response() {
        let proxy = Arc::new(ToolProxy::new(Duration::from_secs(5)));
        let client = Uuid::new_v4();
        let (channel, mut rx) = test_channel();

        let request = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                proxy
                    .request(Some(channel), client, "google", json!({}))
                    .await
            })
        };

        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        proxy.resolve(client, envelope["request_id"].as_str().unwrap(), Value::Null);

        assert_eq!(request.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_timeout_within_bound() {
        let proxy = ToolProxy::new(Duration::from_millis(20));
        let client = Uuid::new_v4();
        let (channel, _rx) = test_channel();

        let started = tokio::time::Instant::now();
        let err = proxy
            .request(Some(channel), client, "filesystem", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(proxy.pending_for(client), 0);
    }

    #[tokio::test]
    async fn test_notify_sends_without_slot() {
        let proxy = ToolProxy::new(Duration::from_secs(5));
        let client = Uuid::new_v4();
        let (channel, mut rx) = test_channel();

        proxy
            .notify(
                Some(channel),
                client,
                "filesystem",
                json!({ "method": "notification/progress" }),
            )
            .unwrap();

        let envelope: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope["type"], "tool_request");
        assert_eq!(proxy.pending_for(client), 0);
    }

    #[tokio::test]
    async fn test_no_connection_fails_fast() {
        let proxy = ToolProxy::new(Duration::from_secs(5));
        let client = Uuid::new_v4();
        assert!(matches!(
            proxy.request(None, client, "filesystem", json!({})).await,
            Err(CommandError::NoConnection(_))
        ));
    }
}
