//! # Request Correlation Layers
//!
//! Two components turn the single duplex channel per client into a set of
//! independent awaitable remote calls:
//!
//! - [`correlation::CorrelationBus`]: general commands (memory, reminder,
//!   workspace requests) issued by tool logic, 15s bound
//! - [`proxy::ToolProxy`]: the HTTP tool-proxy bridge, 30s bound
//!
//! Both share the [`PendingTable`]: slots keyed `(client_id, request_id)`,
//! registered before the request is transmitted, resolved exactly once on
//! one of {response, timeout, disconnect}.

pub mod correlation;
pub mod proxy;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Structured failure of a remote call. These are returned to callers as
/// values; they never cross a tool boundary as panics.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandError {
    /// No channel is registered for the client
    NoConnection(Uuid),

    /// The bounded wait elapsed without a matching response
    Timeout,

    /// The client disconnected while the call was outstanding
    Disconnected,

    /// The channel rejected the outbound envelope
    Channel(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NoConnection(client_id) => {
                write!(f, "No connection available for client {}", client_id)
            }
            CommandError::Timeout => write!(f, "Request timeout"),
            CommandError::Disconnected => write!(f, "Client disconnected"),
            CommandError::Channel(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// Table of in-flight requests awaiting resolution.
///
/// A slot exists from the moment a request is registered until exactly one
/// of resolve / discard / cancel removes it. The map lock is never held
/// across an await.
pub(crate) struct PendingTable {
    slots: Mutex<HashMap<(Uuid, String), oneshot::Sender<Value>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a slot and hand back the receiver the caller suspends on.
    /// Registration happens before transmission so a fast response cannot
    /// arrive before its slot exists.
    pub fn register(&self, client_id: Uuid, request_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .unwrap()
            .insert((client_id, request_id.to_string()), tx);
        rx
    }

    /// Remove a slot without resolving it (timeout / send-failure paths).
    pub fn discard(&self, client_id: Uuid, request_id: &str) {
        self.slots
            .lock()
            .unwrap()
            .remove(&(client_id, request_id.to_string()));
    }

    /// Resolve the matching slot with a payload. Returns false when no slot
    /// matched, meaning a late or unknown response; the caller drops it.
    pub fn resolve(&self, client_id: Uuid, request_id: &str, payload: Value) -> bool {
        let sender = self
            .slots
            .lock()
            .unwrap()
            .remove(&(client_id, request_id.to_string()));
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Drop every slot for a client. Dropping the senders wakes the waiting
    /// callers with a disconnect error, so nobody is suspended forever.
    pub fn cancel_client(&self, client_id: Uuid) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|(id, _), _| *id != client_id);
        before - slots.len()
    }

    pub fn count_for(&self, client_id: Uuid) -> usize {
        self.slots
            .lock()
            .unwrap()
            .keys()
            .filter(|(id, _)| *id == client_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_slot_resolved_exactly_once() {
        let table = PendingTable::new();
        let client = Uuid::new_v4();
        let rx = table.register(client, "r1");

        assert!(table.resolve(client, "r1", json!({"ok": true})));
        // Second resolution of the same id finds no slot.
        assert!(!table.resolve(client, "r1", json!({"ok": false})));

        let value = rx.await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(table.count_for(client), 0);
    }

    #[tokio::test]
    async fn test_cancel_client_wakes_waiters() {
        let table = PendingTable::new();
        let client = Uuid::new_v4();
        let other = Uuid::new_v4();
        let rx = table.register(client, "r1");
        let _other_rx = table.register(other, "r2");

        assert_eq!(table.cancel_client(client), 1);
        assert!(rx.await.is_err());
        // Unrelated client slots survive.
        assert_eq!(table.count_for(other), 1);
    }

    #[test]
    fn test_discard_removes_slot() {
        let table = PendingTable::new();
        let client = Uuid::new_v4();
        let _rx = table.register(client, "r1");
        assert_eq!(table.count_for(client), 1);
        table.discard(client, "r1");
        assert_eq!(table.count_for(client), 0);
    }
}
