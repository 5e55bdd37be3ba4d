//! # Session Router
//!
//! The per-client state machine. Frames from one client are processed
//! strictly in arrival order by that client's receive loop; concurrency
//! exists only between clients and in the background streaming tasks the
//! router spawns.
//!
//! Dispatch is three-tiered: unparseable frames are logged and skipped,
//! `*_response` types are handed to the correlation layers, and everything
//! else must parse into a known [`InboundMessage`] variant or it is logged
//! and skipped. A client can never crash its router with a weird frame.

use base64::prelude::*;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    normalize_memories, InboundMessage, OutboundMessage, TextStartPayload, TextTurnPayload,
    VoiceStartPayload, RESPONSE_SUFFIX, TOOL_RESPONSE_TYPE,
};
use crate::runner::{TextSessionType, TextStream};
use crate::session::registry::{ClientSession, ConnectionRegistry};
use crate::session::{send_envelope, send_value, ChannelSink};

/// Drive one client's inbound frames to completion, then clean up.
///
/// Runs until the frame source closes (the socket actor dropped its sender).
/// Cleanup happens here, on the same task that processed the frames, so no
/// frame can race the teardown.
pub async fn receive_loop(
    registry: Arc<ConnectionRegistry>,
    client_id: Uuid,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = inbound.recv().await {
        dispatch(&registry, client_id, &frame).await;
    }
    debug!(client_id = %client_id, "Frame source closed, cleaning up");
    registry.cleanup(client_id).await;
}

/// Route a single frame.
pub async fn dispatch(registry: &Arc<ConnectionRegistry>, client_id: Uuid, frame: &str) {
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(err) => {
            warn!(client_id = %client_id, "Discarding unparseable frame: {}", err);
            return;
        }
    };

    let message_type = value["type"].as_str().unwrap_or_default().to_string();
    if message_type.ends_with(RESPONSE_SUFFIX) {
        route_response(registry, client_id, &message_type, value);
        return;
    }

    let message: InboundMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(_) => {
            warn!(client_id = %client_id, "Unknown message type '{}'", message_type);
            return;
        }
    };

    let session = match registry.get(client_id).await {
        Some(session) => session,
        None => {
            warn!(client_id = %client_id, "Frame for unregistered client");
            return;
        }
    };

    match message {
        InboundMessage::StartVoiceSession { payload } => {
            start_voice_session(&session, payload).await
        }
        InboundMessage::StopVoiceSession => stop_voice_session(&session).await,
        InboundMessage::StartTextSession { payload } => start_text_session(&session, payload).await,
        InboundMessage::StopTextSession => stop_text_session(&session).await,
        InboundMessage::Text { payload } => text_turn(&session, payload).await,
        InboundMessage::Audio { payload } => route_audio(&session, payload).await,
        InboundMessage::Video { payload } => route_video(&session, payload).await,
    }
}

/// Deliver a `*_response` frame to whichever correlation layer owns it.
fn route_response(
    registry: &Arc<ConnectionRegistry>,
    client_id: Uuid,
    message_type: &str,
    value: Value,
) {
    let request_id = match value["request_id"].as_str() {
        Some(id) => id.to_string(),
        None => {
            warn!(
                client_id = %client_id,
                "Response '{}' missing request_id", message_type
            );
            return;
        }
    };

    let delivered = if message_type == TOOL_RESPONSE_TYPE {
        // Tool responses carry their payload under "data".
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        registry.proxy.resolve(client_id, &request_id, data)
    } else {
        registry.correlation.resolve(client_id, &request_id, value)
    };

    if !delivered {
        debug!(
            client_id = %client_id,
            request_id = %request_id,
            "Dropping late response '{}'", message_type
        );
    }
}

/// Start a voice session from an explicit client request or a wake word
/// detection. Refused while one is already active.
async fn start_voice_session(session: &Arc<ClientSession>, payload: VoiceStartPayload) {
    // The wake consumer and the receive loop can both reach here; the gate
    // serializes their transitions against each other and against cleanup.
    let _gate = session.voice_gate.lock().await;

    if session.is_closed() {
        debug!(client_id = %session.client_id, "Ignoring voice start during teardown");
        return;
    }

    if session.voice_active.load(Ordering::SeqCst) {
        send_envelope(
            &session.channel,
            &OutboundMessage::VoiceSessionError {
                error: "Voice session already active".to_string(),
            },
        );
        return;
    }

    let memories_loaded = payload.memories.len();
    let conversation = match session
        .runner
        .start_voice_conversation(payload.initial_message, payload.memories)
        .await
    {
        Ok(conversation) => conversation,
        Err(err) => {
            warn!(client_id = %session.client_id, "Voice session start failed: {}", err);
            send_envelope(
                &session.channel,
                &OutboundMessage::VoiceSessionError { error: err },
            );
            return;
        }
    };

    session.voice_active.store(true, Ordering::SeqCst);

    let pump = {
        let channel = session.channel.clone();
        let mut events = conversation.events;
        tokio::spawn(async move {
            while let Some(mut event) = events.recv().await {
                if let Value::Object(ref mut map) = event {
                    map.insert("session".to_string(), Value::String("voice".to_string()));
                }
                if send_value(&channel, &event).is_err() {
                    break;
                }
            }
        })
    };
    session.voice_task.set(pump).await;

    info!(client_id = %session.client_id, memories_loaded, "Voice session started");
    send_envelope(
        &session.channel,
        &OutboundMessage::VoiceSessionStarted {
            status: "success",
            memories_loaded,
        },
    );
}

/// Wake word path: same start as an explicit request, no payload.
pub async fn handle_wake_detection(registry: &Arc<ConnectionRegistry>, client_id: Uuid) {
    let session = match registry.get(client_id).await {
        Some(session) => session,
        None => return,
    };
    if session.voice_active.load(Ordering::SeqCst) {
        debug!(client_id = %client_id, "Wake word during active voice session, ignoring");
        return;
    }
    start_voice_session(&session, VoiceStartPayload::default()).await;
}

/// Stopping is always confirmed, even when no session was active, so the
/// client's view converges on "stopped".
async fn stop_voice_session(session: &Arc<ClientSession>) {
    session.stop_voice().await;
    send_envelope(&session.channel, &OutboundMessage::VoiceSessionEnded);
}

async fn start_text_session(session: &Arc<ClientSession>, payload: TextStartPayload) {
    // Nested and flat payload shapes carry the same three fields.
    let (session_type, content, memories) = match payload.initial_message {
        Some(init) => (init.session_type, init.content, init.memories),
        None => (payload.session_type, payload.content, payload.memories),
    };

    if session.text_active.load(Ordering::SeqCst) {
        let current = session
            .current_text_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        send_envelope(
            &session.channel,
            &OutboundMessage::text_error(format!(
                "Text session already active with type '{}'. End the current session first.",
                current
            )),
        );
        return;
    }

    let session_type: TextSessionType = match session_type.as_deref().unwrap_or("chat").parse() {
        Ok(parsed) => parsed,
        Err(err) => {
            send_envelope(&session.channel, &OutboundMessage::text_error(err));
            return;
        }
    };

    let (selected_text, user_query) = match content.as_ref().and_then(extract_text_content) {
        Some(parts) => parts,
        None => {
            send_envelope(
                &session.channel,
                &OutboundMessage::text_error(
                    "Text session requires 'content' with 'selected_text' and 'user_query'"
                        .to_string(),
                ),
            );
            return;
        }
    };

    let memories = normalize_memories(&memories);
    let memories_loaded = memories.len();
    let stream = match session
        .runner
        .start_text_session(session_type, &selected_text, &user_query, memories)
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(client_id = %session.client_id, "Text session start failed: {}", err);
            send_envelope(&session.channel, &OutboundMessage::text_error(err));
            return;
        }
    };

    session.text_active.store(true, Ordering::SeqCst);
    *session.text_session_type.lock().unwrap() = Some(session_type);

    info!(
        client_id = %session.client_id,
        session_type = %session_type,
        memories_loaded,
        "Text session started"
    );
    send_envelope(
        &session.channel,
        &OutboundMessage::TextSessionStarted {
            session_type,
            memories_loaded,
        },
    );

    let streaming = {
        let channel = session.channel.clone();
        tokio::spawn(stream_text_response(channel, stream))
    };
    session.text_task.set(streaming).await;
}

fn extract_text_content(content: &Value) -> Option<(String, String)> {
    let map = content.as_object()?;
    let selected_text = map.get("selected_text")?.as_str()?.to_string();
    let user_query = map.get("user_query")?.as_str()?.to_string();
    Some((selected_text, user_query))
}

async fn text_turn(session: &Arc<ClientSession>, payload: TextTurnPayload) {
    if !session.text_active.load(Ordering::SeqCst) {
        send_envelope(
            &session.channel,
            &OutboundMessage::text_error(
                "No active text session. Start a text session first.".to_string(),
            ),
        );
        return;
    }

    // A new turn supersedes any response still streaming; wait for the old
    // task to actually stop before starting the next one.
    session.text_task.cancel().await;

    let stream = match session.runner.continue_text_conversation(&payload.text).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(client_id = %session.client_id, "Text turn failed: {}", err);
            send_envelope(&session.channel, &OutboundMessage::text_error(err));
            return;
        }
    };

    let streaming = {
        let channel = session.channel.clone();
        tokio::spawn(stream_text_response(channel, stream))
    };
    session.text_task.set(streaming).await;
}

async fn stop_text_session(session: &Arc<ClientSession>) {
    session.stop_text().await;
    send_envelope(&session.channel, &OutboundMessage::TextSessionEnded);
}

/// Forward streamed chunks, then confirm completion. A runner-side error
/// ends the stream without a completion envelope.
async fn stream_text_response(channel: Arc<dyn ChannelSink>, mut stream: TextStream) {
    while let Some(item) = stream.recv().await {
        match item {
            Ok(chunk) => send_envelope(&channel, &OutboundMessage::text_content(chunk)),
            Err(err) => {
                send_envelope(&channel, &OutboundMessage::text_error(err));
                return;
            }
        }
    }
    send_envelope(&channel, &OutboundMessage::text_complete());
}

/// Audio goes to the live voice conversation when one exists, otherwise to
/// the wake word detector.
async fn route_audio(session: &Arc<ClientSession>, payload: Value) {
    if session.voice_active.load(Ordering::SeqCst) {
        if let Err(err) = session.runner.send_voice_content(payload).await {
            warn!(client_id = %session.client_id, "Voice content rejected: {}", err);
        }
        return;
    }

    let encoded = match payload["data"].as_str() {
        Some(encoded) => encoded,
        None => {
            debug!(client_id = %session.client_id, "Audio payload without data field");
            return;
        }
    };
    match BASE64_STANDARD.decode(encoded) {
        Ok(bytes) => session.detector.add_audio_chunk(&bytes),
        Err(err) => {
            warn!(client_id = %session.client_id, "Invalid base64 audio: {}", err);
        }
    }
}

/// Video only has a destination inside a live voice conversation.
async fn route_video(session: &Arc<ClientSession>, payload: Value) {
    if session.voice_active.load(Ordering::SeqCst) {
        if let Err(err) = session.runner.send_voice_content(payload).await {
            warn!(client_id = %session.client_id, "Video content rejected: {}", err);
        }
    } else {
        debug!(client_id = %session.client_id, "Dropping video frame outside voice session");
    }
}
