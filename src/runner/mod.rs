//! # Conversation Runner Interface
//!
//! The conversation runner wraps the external agent engine (LLM session and
//! tool set) that actually produces responses. The gateway never reasons
//! about content; it only starts/stops conversations and moves payloads
//! between the client channel and the runner.
//!
//! One runner instance exists per connected client, created by the
//! [`RunnerFactory`] at registration time. The bundled [`EchoRunner`] is the
//! integration placeholder: it exercises every seam (event streams, content
//! sinks, typed text sessions) without an agent engine behind it, and doubles
//! as the test double for the session router.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::auth::UserContext;

/// Category chosen when a text session starts; governs how subsequent
/// turns are interpreted by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSessionType {
    Explain,
    Rewrite,
    Chat,
}

impl FromStr for TextSessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explain" => Ok(TextSessionType::Explain),
            "rewrite" => Ok(TextSessionType::Rewrite),
            "chat" => Ok(TextSessionType::Chat),
            other => Err(format!(
                "Unknown session type '{}'. Expected 'explain', 'rewrite', or 'chat'.",
                other
            )),
        }
    }
}

impl fmt::Display for TextSessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TextSessionType::Explain => "explain",
            TextSessionType::Rewrite => "rewrite",
            TextSessionType::Chat => "chat",
        };
        write!(f, "{}", s)
    }
}

/// A live voice conversation: the stream of events the runner produces.
/// Input flows the other way through [`ConversationRunner::send_voice_content`].
pub struct VoiceConversation {
    pub events: mpsc::Receiver<Value>,
}

/// Streamed text-response chunks. An `Err` item carries a runner-side
/// failure message and terminates the stream.
pub type TextStream = mpsc::Receiver<Result<String, String>>;

/// The narrow interface the gateway consumes from the agent engine.
///
/// All methods return `Result<_, String>`: runner failures are surfaced to
/// the client as typed error envelopes, never as panics in the router.
#[async_trait]
pub trait ConversationRunner: Send + Sync {
    /// Pre-initialize the engine so the first session start is instant.
    async fn warm_up(&self) -> Result<(), String>;

    async fn start_voice_conversation(
        &self,
        initial_message: Option<String>,
        memories: Vec<Value>,
    ) -> Result<VoiceConversation, String>;

    /// Forward client media/content into the active voice conversation.
    async fn send_voice_content(&self, payload: Value) -> Result<(), String>;

    async fn end_voice_conversation(&self) -> Result<(), String>;

    async fn start_text_session(
        &self,
        session_type: TextSessionType,
        selected_text: &str,
        user_query: &str,
        memories: Vec<Value>,
    ) -> Result<TextStream, String>;

    async fn continue_text_conversation(&self, text: &str) -> Result<TextStream, String>;

    async fn end_text_conversation(&self) -> Result<(), String>;
}

/// Creates one runner per connected client.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, user: &UserContext) -> Arc<dyn ConversationRunner>;
}

/// Placeholder runner that echoes input back as output.
///
/// Voice content sent in reappears on the event stream; text sessions reply
/// with a canned echo of the query. Useful for wiring tests and local
/// development without an agent engine.
pub struct EchoRunner {
    voice_events: Mutex<Option<mpsc::Sender<Value>>>,
}

impl EchoRunner {
    pub fn new() -> Self {
        Self {
            voice_events: Mutex::new(None),
        }
    }

    fn echo_stream(prefix: &str, text: &str) -> TextStream {
        let (tx, rx) = mpsc::channel(8);
        // Two chunks so streaming consumers see more than one delivery.
        let _ = tx.try_send(Ok(format!("[{}] ", prefix)));
        let _ = tx.try_send(Ok(text.to_string()));
        rx
    }
}

impl Default for EchoRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationRunner for EchoRunner {
    async fn warm_up(&self) -> Result<(), String> {
        Ok(())
    }

    async fn start_voice_conversation(
        &self,
        initial_message: Option<String>,
        _memories: Vec<Value>,
    ) -> Result<VoiceConversation, String> {
        let (tx, rx) = mpsc::channel(64);
        if let Some(message) = initial_message {
            let _ = tx.try_send(json!({ "type": "voice_event", "data": message }));
        }
        *self.voice_events.lock().unwrap() = Some(tx);
        Ok(VoiceConversation { events: rx })
    }

    async fn send_voice_content(&self, payload: Value) -> Result<(), String> {
        let sender = self.voice_events.lock().unwrap().clone();
        match sender {
            Some(tx) => {
                // Drop on a full buffer rather than blocking the router.
                let _ = tx.try_send(json!({ "type": "voice_event", "data": payload }));
                Ok(())
            }
            None => Err("No active voice conversation".to_string()),
        }
    }

    async fn end_voice_conversation(&self) -> Result<(), String> {
        self.voice_events.lock().unwrap().take();
        Ok(())
    }

    async fn start_text_session(
        &self,
        session_type: TextSessionType,
        _selected_text: &str,
        user_query: &str,
        _memories: Vec<Value>,
    ) -> Result<TextStream, String> {
        Ok(Self::echo_stream(&session_type.to_string(), user_query))
    }

    async fn continue_text_conversation(&self, text: &str) -> Result<TextStream, String> {
        Ok(Self::echo_stream("echo", text))
    }

    async fn end_text_conversation(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Factory producing [`EchoRunner`] instances.
pub struct EchoRunnerFactory;

impl RunnerFactory for EchoRunnerFactory {
    fn create(&self, _user: &UserContext) -> Arc<dyn ConversationRunner> {
        Arc::new(EchoRunner::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_type_parsing() {
        assert_eq!("chat".parse::<TextSessionType>(), Ok(TextSessionType::Chat));
        assert_eq!(
            "explain".parse::<TextSessionType>(),
            Ok(TextSessionType::Explain)
        );
        assert!("summarize".parse::<TextSessionType>().is_err());
        assert_eq!(TextSessionType::Rewrite.to_string(), "rewrite");
    }

    #[tokio::test]
    async fn test_echo_runner_voice_roundtrip() {
        let runner = EchoRunner::new();
        let mut conversation = runner
            .start_voice_conversation(None, Vec::new())
            .await
            .unwrap();

        runner
            .send_voice_content(json!({ "data": "abc" }))
            .await
            .unwrap();

        let event = conversation.events.recv().await.unwrap();
        assert_eq!(event["type"], "voice_event");

        runner.end_voice_conversation().await.unwrap();
        assert!(runner
            .send_voice_content(json!({ "data": "late" }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_echo_runner_text_stream_completes() {
        let runner = EchoRunner::new();
        let mut stream = runner
            .start_text_session(TextSessionType::Chat, "", "hi", Vec::new())
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(item) = stream.recv().await {
            chunks.push(item.unwrap());
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].contains("hi"));
    }
}
