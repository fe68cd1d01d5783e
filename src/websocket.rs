//! # WebSocket Voice Session Handler
//!
//! Clients connect to `/ws` and exchange binary protocol frames (see
//! [`crate::protocol`]). Each connection is an actix actor that:
//!
//! 1. **Registers** itself in the session registry when it starts
//! 2. **Forwards** every binary message to its dispatcher task, in order,
//!    closing the connection if the client outruns a full queue
//! 3. **Writes** outbound frames the dispatcher sends back through the actor address
//! 4. **Pings** the client and closes silent connections
//! 5. **Unregisters** when it stops, which also ends the dispatcher loop
//!
//! ## Actor Model:
//! The actor never awaits anything. The pipeline call and response pacing run
//! in the dispatcher task, so pings, pongs and close frames keep flowing while
//! an utterance is being answered.

use crate::audio::FrameSink;
use crate::dispatcher::{Dispatcher, InboundFrame};
use crate::error::{AppError, ProtocolError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError, Sender};
use tracing::{debug, error, info, warn};

/// WebSocket actor for one voice session.
pub struct VoiceSocket {
    state: AppState,

    /// Server-generated id, set once the session is registered
    session_id: Option<String>,

    /// Inbound side of the dispatcher channel; dropping it ends the loop
    inbound: Option<Sender<InboundFrame>>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceSocket {
    pub fn new(state: AppState) -> Self {
        let config = state.get_config();
        Self {
            state,
            session_id: None,
            inbound: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: config.streaming.heartbeat_interval(),
            client_timeout: config.streaming.client_timeout(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = ?act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Wrap a binary message for the dispatcher, tagged with whether the
    /// session was busy answering when it arrived.
    fn tag_inbound(&self, session_id: &str, bytes: Bytes) -> InboundFrame {
        let busy = self
            .state
            .registry
            .get(session_id)
            .map(|session| session.state().is_busy())
            .unwrap_or(false);

        if busy {
            InboundFrame::busy(bytes)
        } else {
            InboundFrame::new(bytes)
        }
    }

    fn forward(&mut self, bytes: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let (Some(session_id), Some(inbound)) = (&self.session_id, &self.inbound) else {
            warn!("Binary message before session registration, dropping");
            return;
        };

        match inbound.try_send(self.tag_inbound(session_id, bytes)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%session_id, "Inbound queue full, closing connection");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("Too many queued messages".to_string()),
                }));
                ctx.stop();
            }
            Err(TrySendError::Closed(_)) => {
                error!(%session_id, "Dispatcher is gone, closing connection");
                ctx.stop();
            }
        }
    }
}

/// Outbound frame for the client, sent by the dispatcher through the actor address.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundFrame(pub Bytes);

/// [`FrameSink`] that writes through a connection actor.
pub struct ActorFrameSink {
    recipient: Recipient<OutboundFrame>,
}

impl ActorFrameSink {
    pub fn new(recipient: Recipient<OutboundFrame>) -> Self {
        Self { recipient }
    }
}

impl FrameSink for ActorFrameSink {
    fn deliver(&self, frame: Bytes) -> Result<(), ProtocolError> {
        if !self.recipient.connected() {
            return Err(ProtocolError::TransportFailure("connection closed".to_string()));
        }
        self.recipient.do_send(OutboundFrame(frame));
        Ok(())
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Register the session and spawn its dispatcher loop.
    fn started(&mut self, ctx: &mut Self::Context) {
        let sink = Arc::new(ActorFrameSink::new(ctx.address().recipient()));

        let session_id = match self.state.registry.create(sink) {
            Ok(id) => id,
            Err(e) => {
                // Lost a race for the last slot after the upgrade check
                warn!(error = %e, "Rejecting WebSocket session");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(e.to_string()),
                }));
                ctx.stop();
                return;
            }
        };

        let queue = self.state.get_config().streaming.inbound_queue_frames;
        let (tx, rx) = mpsc::channel(queue);
        let dispatcher = Dispatcher::new(session_id.clone(), self.state.clone());
        actix_web::rt::spawn(dispatcher.run(rx));

        info!(%session_id, active = self.state.registry.active_count(), "WebSocket session started");
        self.session_id = Some(session_id);
        self.inbound = Some(tx);
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender lets the dispatcher drain and exit
        self.inbound.take();

        if let Some(session_id) = self.session_id.take() {
            self.state.registry.remove(&session_id);
            info!(%session_id, "WebSocket session stopped");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(data, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                debug!(len = text.len(), "Ignoring text message; protocol is binary only");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = ?self.session_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Dropping continuation frame; fragmented messages are not reassembled");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                // Transport failure: nothing to report, just tear down
                error!(session_id = ?self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses the upgrade with 503 when the session limit is already reached,
/// otherwise hands the connection to a [`VoiceSocket`] actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    if !app_state.registry.has_capacity() {
        let max = app_state.get_config().streaming.max_concurrent_sessions;
        warn!(max, "Session limit reached, refusing upgrade");
        return Err(AppError::Unavailable(format!(
            "Maximum concurrent sessions ({}) reached",
            max
        ))
        .into());
    }

    let max_frame_bytes = app_state.get_config().streaming.max_frame_bytes;
    let socket = VoiceSocket::new(app_state.get_ref().clone());

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
