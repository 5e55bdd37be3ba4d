//! # Session Layer
//!
//! Per-client session management: the connection registry, the message
//! router, and the channel abstraction that decouples both from the
//! WebSocket transport.

pub mod registry;
pub mod router;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::OutboundMessage;

/// The peer went away; the frame was not delivered.
#[derive(Debug)]
pub struct ChannelClosed;

/// Outbound half of a client channel.
///
/// The registry and router only ever push serialized text frames; the
/// WebSocket actor implements this over its actix mailbox, and tests
/// implement it over a plain channel.
pub trait ChannelSink: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), ChannelClosed>;
}

impl ChannelSink for mpsc::UnboundedSender<String> {
    fn send_text(&self, text: String) -> Result<(), ChannelClosed> {
        self.send(text).map_err(|_| ChannelClosed)
    }
}

/// Serialize and push an outbound envelope, logging delivery failures.
/// A failed send means the client is gone; cleanup handles the rest.
pub fn send_envelope(channel: &Arc<dyn ChannelSink>, message: &OutboundMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if channel.send_text(text).is_err() {
                warn!("Failed to deliver envelope: channel closed");
            }
        }
        Err(err) => warn!("Failed to serialize outbound envelope: {}", err),
    }
}

/// Push a raw JSON value over the channel (correlation and proxy requests,
/// which are built dynamically rather than from the outbound enum).
pub fn send_value(channel: &Arc<dyn ChannelSink>, value: &Value) -> Result<(), ChannelClosed> {
    let text = serde_json::to_string(value).map_err(|_| ChannelClosed)?;
    channel.send_text(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_sender_sink_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let channel: Arc<dyn ChannelSink> = Arc::new(tx);

        send_envelope(&channel, &OutboundMessage::Initialized);
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("\"initialized\""));
    }

    #[test]
    fn test_send_value_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(rx);
        let channel: Arc<dyn ChannelSink> = Arc::new(tx);
        assert!(send_value(&channel, &serde_json::json!({"type": "ping"})).is_err());
    }
}
