//! # Channel Envelope Types
//!
//! Every message exchanged over a client channel is an envelope:
//! `{ "type": string, ...fields }`. Inbound envelopes are modeled as a
//! closed tagged enum so dispatch is an exhaustive match rather than a
//! string-equality chain; the one open-ended family, types ending in
//! `_response`, is peeled off before enum parsing and routed to the
//! correlation layers.
//!
//! ## Message Flow:
//! - **Client → Server**: session lifecycle commands, text turns, base64
//!   audio/video payloads, and responses to gateway-issued requests
//! - **Server → Client**: session confirmations, streamed text content,
//!   typed errors, and correlation/tool-proxy requests

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runner::TextSessionType;

/// Inbound types ending in this suffix are responses to gateway-issued
/// requests and bypass the session state machine.
pub const RESPONSE_SUFFIX: &str = "_response";

/// Responses for the tool proxy; everything else with the response suffix
/// resolves a correlation-bus slot.
pub const TOOL_RESPONSE_TYPE: &str = "tool_response";

/// Inbound message kinds handled by the session router.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    StartVoiceSession {
        #[serde(default)]
        payload: VoiceStartPayload,
    },
    StartTextSession {
        #[serde(default)]
        payload: TextStartPayload,
    },
    StopVoiceSession,
    StopTextSession,
    Text {
        #[serde(default)]
        payload: TextTurnPayload,
    },
    Audio {
        #[serde(default)]
        payload: Value,
    },
    Video {
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct VoiceStartPayload {
    pub initial_message: Option<String>,
    #[serde(default)]
    pub memories: Vec<Value>,
}

/// Text session start payload. Clients may nest the request under
/// `initial_message` or send the fields flat; both shapes are accepted.
#[derive(Debug, Default, Deserialize)]
pub struct TextStartPayload {
    pub initial_message: Option<TextInitialMessage>,
    pub session_type: Option<String>,
    pub content: Option<Value>,
    #[serde(default)]
    pub memories: Value,
}

#[derive(Debug, Deserialize)]
pub struct TextInitialMessage {
    pub session_type: Option<String>,
    pub content: Option<Value>,
    #[serde(default)]
    pub memories: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct TextTurnPayload {
    #[serde(default)]
    pub text: String,
}

/// Memories arrive either as a bare list or wrapped as
/// `{"memories": [...]}`; anything else counts as none.
pub fn normalize_memories(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("memories") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Outbound envelopes produced by the session router.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Initialized,
    VoiceSessionStarted {
        status: &'static str,
        memories_loaded: usize,
    },
    VoiceSessionError {
        error: String,
    },
    VoiceSessionEnded,
    TextSessionStarted {
        session_type: TextSessionType,
        memories_loaded: usize,
    },
    TextSessionEnded,
    TextContent {
        session: &'static str,
        data: String,
    },
    Complete {
        session: &'static str,
        data: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<&'static str>,
        error: String,
    },
}

impl OutboundMessage {
    pub fn text_content(data: String) -> Self {
        OutboundMessage::TextContent {
            session: "text",
            data,
        }
    }

    pub fn text_complete() -> Self {
        OutboundMessage::Complete {
            session: "text",
            data: String::new(),
        }
    }

    pub fn text_error(error: String) -> Self {
        OutboundMessage::Error {
            session: Some("text"),
            error,
        }
    }

    pub fn error(error: String) -> Self {
        OutboundMessage::Error {
            session: None,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_start_voice_parses_with_and_without_payload() {
        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "start_voice_session", "payload": {} }))
                .unwrap();
        assert!(matches!(msg, InboundMessage::StartVoiceSession { .. }));

        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "stop_voice_session" })).unwrap();
        assert!(matches!(msg, InboundMessage::StopVoiceSession));
    }

    #[test]
    fn test_inbound_unknown_type_is_an_error() {
        let result = serde_json::from_value::<InboundMessage>(json!({ "type": "telemetry" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_voice_session_started_wire_shape() {
        let msg = OutboundMessage::VoiceSessionStarted {
            status: "success",
            memories_loaded: 0,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "voice_session_started",
                "status": "success",
                "memories_loaded": 0
            })
        );
    }

    #[test]
    fn test_error_envelope_omits_absent_session_tag() {
        let bare = serde_json::to_value(OutboundMessage::error("boom".into())).unwrap();
        assert!(bare.get("session").is_none());

        let tagged = serde_json::to_value(OutboundMessage::text_error("boom".into())).unwrap();
        assert_eq!(tagged["session"], "text");
    }

    #[test]
    fn test_normalize_memories_shapes() {
        assert_eq!(normalize_memories(&json!([1, 2])).len(), 2);
        assert_eq!(normalize_memories(&json!({ "memories": [1] })).len(), 1);
        assert_eq!(normalize_memories(&json!("nope")).len(), 0);
        assert_eq!(normalize_memories(&Value::Null).len(), 0);
    }

    #[test]
    fn test_text_start_accepts_nested_and_flat_shapes() {
        let nested: InboundMessage = serde_json::from_value(json!({
            "type": "start_text_session",
            "payload": {
                "initial_message": {
                    "session_type": "chat",
                    "content": { "selected_text": "", "user_query": "hi" }
                }
            }
        }))
        .unwrap();
        match nested {
            InboundMessage::StartTextSession { payload } => {
                assert!(payload.initial_message.is_some());
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let flat: InboundMessage = serde_json::from_value(json!({
            "type": "start_text_session",
            "payload": {
                "session_type": "explain",
                "content": { "selected_text": "a", "user_query": "b" }
            }
        }))
        .unwrap();
        match flat {
            InboundMessage::StartTextSession { payload } => {
                assert_eq!(payload.session_type.as_deref(), Some("explain"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
