//! # Carrier Media Stream WebSocket
//!
//! The telephony carrier opens one WebSocket per call and streams JSON text frames over
//! it. Each connection gets its own [`CallSocket`] actor, which owns nothing but the
//! socket: all call logic lives in the session task created in the [`SessionRegistry`].
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: `GET {ws_path}` assigns a `conn_<uuid>` identity and starts the actor
//! 2. **started**: The session is created; a duplicate id or a full registry closes the
//!    socket with a policy-violation close code
//! 3. **Streaming**: Text frames are dispatched to the session in arrival order, outbound
//!    frames come back as [`OutboundText`] messages
//! 4. **stopped**: The session is removed, whatever state it was in
//!
//! ## Heartbeat:
//! The actor pings every `heartbeat.interval_secs` and drops a carrier that has shown no
//! sign of life (text, ping or pong) for `interval_secs + timeout_secs`.

use crate::config::{HeartbeatConfig, SessionConfig};
use crate::error::SessionError;
use crate::session::{FrameSink, SessionRegistry};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One encoded outbound frame for the carrier.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct OutboundText(pub String);

/// Sessions write to the socket actor's mailbox.
///
/// `do_send` ignores the mailbox capacity, so the only failure is an actor that has
/// already stopped.
impl FrameSink for Recipient<OutboundText> {
    fn send_text(&self, text: String) -> Result<(), SessionError> {
        if !self.connected() {
            return Err(SessionError::SendFailure("websocket connection closed".to_string()));
        }
        self.do_send(OutboundText(text));
        Ok(())
    }
}

/// Actor bridging one carrier WebSocket to its call session.
pub struct CallSocket {
    connection_id: String,
    registry: SessionRegistry,
    session_config: SessionConfig,
    heartbeat: HeartbeatConfig,
    last_heartbeat: Instant,
}

impl CallSocket {
    pub fn new(
        connection_id: String,
        registry: SessionRegistry,
        session_config: SessionConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            connection_id,
            registry,
            session_config,
            heartbeat,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat.interval(), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.heartbeat.client_timeout() {
                warn!(connection_id = %act.connection_id, "💔 Heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn dispatch(&self, text: String) {
        match self.registry.dispatch(&self.connection_id, text) {
            Ok(()) => {}
            // The call already ended (stop event or send failure); late frames are expected
            Err(err @ (SessionError::NotFound(_) | SessionError::Closed(_))) => {
                debug!(connection_id = %self.connection_id, error = %err, "Frame after session end ignored");
            }
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "❌ Failed to dispatch frame");
            }
        }
    }
}

impl Actor for CallSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "🔌 Carrier connected");
        self.start_heartbeat(ctx);

        let sink: Arc<dyn FrameSink> = Arc::new(ctx.address().recipient::<OutboundText>());
        if let Err(err) = self.registry.create(&self.connection_id, &self.session_config, sink) {
            error!(connection_id = %self.connection_id, error = %err, "❌ Session rejected");
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Policy,
                description: Some(err.to_string()),
            }));
            ctx.stop();
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.registry.remove(&self.connection_id);
        info!(connection_id = %self.connection_id, "🔌 Carrier disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.dispatch(text.to_string());
            }
            Ok(ws::Message::Binary(data)) => {
                // The carrier protocol is JSON text only
                warn!(connection_id = %self.connection_id, bytes = data.len(), "Binary frame ignored");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "Carrier closed the stream");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundText> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket upgrade endpoint for the carrier.
pub async fn carrier_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    info!(
        %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "New carrier stream request"
    );

    let config = state.get_config();
    let socket = CallSocket::new(
        connection_id,
        state.registry.clone(),
        config.session,
        config.heartbeat,
    );

    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collector {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<OutboundText> for Collector {
        type Result = ();

        fn handle(&mut self, msg: OutboundText, _ctx: &mut Self::Context) {
            self.seen.lock().unwrap().push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "()")]
    struct Halt;

    impl Handler<Halt> for Collector {
        type Result = ();

        fn handle(&mut self, _msg: Halt, ctx: &mut Self::Context) {
            ctx.stop();
        }
    }

    #[actix_web::test]
    async fn test_recipient_sink_fails_once_actor_stops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector { seen: Arc::clone(&seen) }.start();
        let sink: Arc<dyn FrameSink> = Arc::new(addr.clone().recipient::<OutboundText>());

        assert!(sink.send_text("{\"event\":\"clear\"}".to_string()).is_ok());
        addr.send(Halt).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["{\"event\":\"clear\"}".to_string()]);
        drop(addr);

        let mut result = Ok(());
        for _ in 0..100 {
            result = sink.send_text("late".to_string());
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(result, Err(SessionError::SendFailure(_))));
    }
}
