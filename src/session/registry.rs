//! # Connection Registry
//!
//! Owns all per-client state. A client exists in exactly one place, this
//! registry, from WebSocket admission until cleanup; the HTTP surface, the
//! correlation layers, and the wake word consumer all reach client state
//! through it.
//!
//! ## Per-client resources:
//! - the outbound channel sink
//! - the conversation runner instance
//! - voice/text session flags and their streaming tasks
//! - the wake word detector and its consumer task
//!
//! Cleanup is idempotent and runs in a fixed order: mark the session
//! closed, stop the detector and its consumer, end active sessions, cancel
//! remaining tasks, cancel pending remote calls, then drop the entry. The
//! detector side goes down before the sessions so a detection landing
//! mid-teardown cannot restart a voice session. A second cleanup for the
//! same id is a no-op.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::UserContext;
use crate::comms::correlation::CorrelationBus;
use crate::comms::proxy::ToolProxy;
use crate::comms::CommandError;
use crate::config::WakeWordConfig;
use crate::protocol::OutboundMessage;
use crate::runner::{ConversationRunner, TextSessionType};
use crate::session::{router, send_envelope, ChannelSink};
use crate::wakeword::{WakeWordDetector, WakeWordOutput};

/// A background task slot with cancel-and-await semantics.
///
/// Replacing or cancelling always aborts the old task and, on the cancel
/// path, awaits its completion so no stale task keeps writing to the
/// channel after its successor starts.
pub struct TaskSlot {
    inner: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn set(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.inner.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Abort the held task and wait for it to finish.
    pub async fn cancel(&self) {
        let taken = self.inner.lock().await.take();
        if let Some(handle) = taken {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the gateway holds for one connected client.
pub struct ClientSession {
    pub client_id: Uuid,
    pub channel: Arc<dyn ChannelSink>,
    pub user: UserContext,
    pub runner: Arc<dyn ConversationRunner>,
    pub detector: Arc<WakeWordDetector>,

    pub voice_active: AtomicBool,
    pub text_active: AtomicBool,
    pub text_session_type: StdMutex<Option<TextSessionType>>,

    /// Serializes voice start/stop transitions. The wake consumer, the
    /// receive loop, and cleanup all take this gate, so a start can never
    /// interleave with a teardown.
    pub voice_gate: Mutex<()>,
    closed: AtomicBool,

    pub voice_task: TaskSlot,
    pub text_task: TaskSlot,
    wake_task: TaskSlot,
    init_task: TaskSlot,
}

impl ClientSession {
    pub fn current_text_type(&self) -> Option<TextSessionType> {
        *self.text_session_type.lock().unwrap()
    }

    /// True once cleanup has begun. No new session may start after this.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the voice session if one is active. Safe to call when none is.
    pub async fn stop_voice(&self) {
        let _gate = self.voice_gate.lock().await;
        self.voice_task.cancel().await;
        if self.voice_active.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.runner.end_voice_conversation().await {
                warn!(client_id = %self.client_id, "Error ending voice conversation: {}", err);
            }
            info!(client_id = %self.client_id, "Voice session ended");
        }
    }

    /// End the text session if one is active. Safe to call when none is.
    pub async fn stop_text(&self) {
        self.text_task.cancel().await;
        if self.text_active.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.runner.end_text_conversation().await {
                warn!(client_id = %self.client_id, "Error ending text conversation: {}", err);
            }
            info!(client_id = %self.client_id, "Text session ended");
        }
        *self.text_session_type.lock().unwrap() = None;
    }
}

/// Live-connection counts reported by the health endpoint.
#[derive(Debug, serde::Serialize)]
pub struct RegistryStats {
    pub active_clients: usize,
    pub active_voice_sessions: usize,
    pub active_text_sessions: usize,
    pub active_wake_word_detectors: usize,
}

pub struct ConnectionRegistry {
    clients: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
    pub correlation: Arc<CorrelationBus>,
    pub proxy: Arc<ToolProxy>,
    wake_config: WakeWordConfig,
}

impl ConnectionRegistry {
    pub fn new(
        correlation: Arc<CorrelationBus>,
        proxy: Arc<ToolProxy>,
        wake_config: WakeWordConfig,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            correlation,
            proxy,
            wake_config,
        }
    }

    /// Admit a connection: allocate an id, start the wake word detector and
    /// the runner warm-up, and make the client addressable.
    pub async fn register(
        self: &Arc<Self>,
        channel: Arc<dyn ChannelSink>,
        user: UserContext,
        runner: Arc<dyn ConversationRunner>,
    ) -> Uuid {
        let client_id = Uuid::new_v4();
        let detector = Arc::new(WakeWordDetector::new(self.wake_config.clone()));

        let session = Arc::new(ClientSession {
            client_id,
            channel: channel.clone(),
            user,
            runner: runner.clone(),
            detector: detector.clone(),
            voice_active: AtomicBool::new(false),
            text_active: AtomicBool::new(false),
            text_session_type: StdMutex::new(None),
            voice_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            voice_task: TaskSlot::new(),
            text_task: TaskSlot::new(),
            wake_task: TaskSlot::new(),
            init_task: TaskSlot::new(),
        });

        self.clients.write().await.insert(client_id, session.clone());
        info!(client_id = %client_id, username = %session.user.username, "Client registered");

        // Detection loop and its event consumer live and die together.
        let wake_handle = {
            let registry = self.clone();
            let detector = detector.clone();
            tokio::spawn(async move {
                let (event_tx, event_rx) = mpsc::channel(32);
                tokio::join!(
                    detector.run(event_tx),
                    consume_wake_events(registry, client_id, event_rx)
                );
            })
        };
        session.wake_task.set(wake_handle).await;

        // Warm the runner so the first session start is instant, then tell
        // the client the connection is ready to use.
        let init_handle = {
            let runner = runner.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                match runner.warm_up().await {
                    Ok(()) => {
                        debug!(client_id = %client_id, "Runner warm-up complete");
                        send_envelope(&channel, &OutboundMessage::Initialized);
                    }
                    Err(err) => {
                        error!(client_id = %client_id, "Runner warm-up failed: {}", err);
                        send_envelope(
                            &channel,
                            &OutboundMessage::error(format!("Initialization failed: {}", err)),
                        );
                    }
                }
            })
        };
        session.init_task.set(init_handle).await;

        client_id
    }

    pub async fn get(&self, client_id: Uuid) -> Option<Arc<ClientSession>> {
        self.clients.read().await.get(&client_id).cloned()
    }

    pub async fn channel_for(&self, client_id: Uuid) -> Option<Arc<dyn ChannelSink>> {
        self.clients
            .read()
            .await
            .get(&client_id)
            .map(|session| session.channel.clone())
    }

    /// Release every resource held for a client. Idempotent.
    pub async fn cleanup(&self, client_id: Uuid) {
        let session = match self.get(client_id).await {
            Some(session) => session,
            None => {
                // Already cleaned up; pending-call cancellation is a no-op.
                self.correlation.cancel_client(client_id);
                self.proxy.cancel_client(client_id);
                return;
            }
        };

        session.closed.store(true, Ordering::SeqCst);

        // The detector and its consumer go down before the sessions: a
        // detection that slips in mid-teardown must not restart one.
        session.detector.stop();
        session.wake_task.cancel().await;

        session.stop_voice().await;
        session.stop_text().await;
        session.init_task.cancel().await;

        self.correlation.cancel_client(client_id);
        self.proxy.cancel_client(client_id);

        self.clients.write().await.remove(&client_id);
        info!(client_id = %client_id, "Client cleaned up");
    }

    pub async fn stats(&self) -> RegistryStats {
        let clients = self.clients.read().await;
        RegistryStats {
            active_clients: clients.len(),
            active_voice_sessions: clients
                .values()
                .filter(|s| s.voice_active.load(Ordering::SeqCst))
                .count(),
            active_text_sessions: clients
                .values()
                .filter(|s| s.text_active.load(Ordering::SeqCst))
                .count(),
            active_wake_word_detectors: clients
                .values()
                .filter(|s| s.detector.is_running())
                .count(),
        }
    }

    /// Issue a correlated command to a client and await the response.
    pub async fn command(
        &self,
        client_id: Uuid,
        command_type: &str,
        action: &str,
        data: Value,
    ) -> Result<Value, CommandError> {
        let channel = self.channel_for(client_id).await;
        self.correlation
            .request(channel, client_id, command_type, action, data)
            .await
    }

    /// Issue a fire-and-forget command to a client.
    pub async fn notify_command(
        &self,
        client_id: Uuid,
        command_type: &str,
        action: &str,
        data: Value,
    ) -> Result<(), CommandError> {
        let channel = self.channel_for(client_id).await;
        self.correlation
            .notify(channel, client_id, command_type, action, data)
    }
}

/// Turn detection events into voice session starts. Status events are
/// score telemetry and are dropped here.
async fn consume_wake_events(
    registry: Arc<ConnectionRegistry>,
    client_id: Uuid,
    event_rx: mpsc::Receiver<WakeWordOutput>,
) {
    let mut events = ReceiverStream::new(event_rx);
    while let Some(event) = events.next().await {
        match event {
            WakeWordOutput::Detected {
                wake_word,
                confidence,
                ..
            } => {
                info!(
                    client_id = %client_id,
                    wake_word = %wake_word,
                    confidence,
                    "Wake word detected, starting voice session"
                );
                router::handle_wake_detection(&registry, client_id).await;
            }
            WakeWordOutput::Status { .. } => {}
        }
    }
}
