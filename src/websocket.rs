//! # WebSocket Session Transport
//!
//! The `/ws` endpoint. Each accepted connection becomes an actix actor that
//! does exactly two jobs: forward inbound text frames to the client's
//! router task, and write outbound frames handed to it by the rest of the
//! gateway. All session logic lives behind the registry; the actor is a
//! dumb pipe with a heartbeat.
//!
//! ## Admission:
//! The token is resolved *before* the upgrade completes. A missing or
//! invalid token still gets a WebSocket handshake, followed immediately by
//! close code 4001 and the refusal reason, so clients can distinguish
//! auth failures from network failures.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::UserContext;
use crate::session::router;
use crate::session::{ChannelClosed, ChannelSink};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Application close code for refused admission.
const ADMISSION_REFUSED: u16 = 4001;

/// Outbound text frame for a connected socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub String);

/// Registry finished admitting this connection.
#[derive(Message)]
#[rtype(result = "()")]
struct Registered(Uuid);

/// Channel sink over the actor mailbox. Everything the gateway sends to a
/// client funnels through here.
pub struct RecipientSink {
    recipient: Recipient<Outbound>,
}

impl ChannelSink for RecipientSink {
    fn send_text(&self, text: String) -> Result<(), ChannelClosed> {
        self.recipient.try_send(Outbound(text)).map_err(|_| ChannelClosed)
    }
}

/// Outcome of resolving the admission token, decided before the actor starts.
enum Admission {
    Granted(UserContext),
    Rejected(String),
}

pub struct SessionSocket {
    state: web::Data<AppState>,
    admission: Option<Admission>,
    client_id: Option<Uuid>,
    inbound: Option<mpsc::UnboundedSender<String>>,
    last_heartbeat: Instant,
}

impl SessionSocket {
    fn new(state: web::Data<AppState>, admission: Admission) -> Self {
        Self {
            state,
            admission: Some(admission),
            client_id: None,
            inbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let user = match self.admission.take() {
            Some(Admission::Granted(user)) => user,
            Some(Admission::Rejected(reason)) => {
                info!("Refusing WebSocket connection: {}", reason);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Other(ADMISSION_REFUSED),
                    description: Some(reason),
                }));
                ctx.stop();
                return;
            }
            None => {
                ctx.stop();
                return;
            }
        };

        info!(username = %user.username, "WebSocket connection admitted");
        self.start_heartbeat(ctx);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        self.inbound = Some(frame_tx);

        // Register with the registry off the actor thread, then drive the
        // router loop until this actor drops its frame sender.
        let addr = ctx.address();
        let sink: Arc<dyn ChannelSink> = Arc::new(RecipientSink {
            recipient: addr.clone().recipient(),
        });
        let registry = self.state.registry.clone();
        let factory = self.state.runner_factory.clone();
        tokio::spawn(async move {
            let runner = factory.create(&user);
            let client_id = registry.register(sink, user, runner).await;
            addr.do_send(Registered(client_id));
            router::receive_loop(registry, client_id, frame_rx).await;
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the frame sender ends the receive loop, which runs the
        // registry cleanup for this client.
        self.inbound.take();
        if let Some(client_id) = self.client_id {
            info!(client_id = %client_id, "WebSocket connection closed");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                if let Some(tx) = &self.inbound {
                    if tx.send(text.to_string()).is_err() {
                        error!("Router task gone, closing connection");
                        ctx.stop();
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                // The protocol is JSON envelopes only; audio travels base64
                // inside them.
                warn!("Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Registered> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: Registered, _ctx: &mut Self::Context) {
        self.client_id = Some(msg.0);
    }
}

fn token_from_query(query_string: &str) -> Option<String> {
    let query = web::Query::<HashMap<String, String>>::from_query(query_string).ok()?;
    query.get("token").filter(|t| !t.is_empty()).cloned()
}

/// WebSocket endpoint handler: resolve the token, then upgrade.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(
        "WebSocket connection request from {:?}",
        req.connection_info().peer_addr()
    );

    let admission = match token_from_query(req.query_string()) {
        None => Admission::Rejected("Missing authentication token".to_string()),
        Some(token) => match app_state.token_validator.resolve_user(&token).await {
            Some(user) => Admission::Granted(user),
            None => Admission::Rejected("Invalid or expired token".to_string()),
        },
    };

    ws::start(SessionSocket::new(app_state, admission), &req, stream)
}
