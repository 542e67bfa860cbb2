//! # Client Gateway
//!
//! One actix WebSocket actor per browser connection (`GET /ws`). It translates
//! between the browser's JSON event protocol and the session layer.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The server assigns a client id and sends `welcome`
//! 2. **Recognition**: `start_recognition`, then audio as `audio_chunk`
//!    (base64) or raw binary frames, then `stop_recognition` (or wait for the
//!    silence auto-stop)
//! 3. **Synthesis**: `synthesize {text}`; audio streams back as `audio_chunk`
//!    events followed by `synthesis_complete`
//! 4. **Heartbeat**: Server pings periodically; silent clients are dropped
//!
//! ## Message Format:
//! Every message is a JSON text frame tagged by `"type"`, e.g.
//! `{"type":"result","text":"你好"}`.
//!
//! ## Event delivery:
//! Session tasks push [`SessionEvent`]s into a bounded channel owned by the
//! actor. The receiving end is attached to the actor as a stream, so events of
//! one session reach the browser in the order they were produced.

use crate::error::SessionError;
use crate::session::{
    start_recognition, start_synthesis, validate_pcm_frame, ClientId, EventSender, SessionEvent, SessionId,
    SessionKind,
};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Messages the browser sends.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartRecognition,
    /// Base64-wrapped 16-bit PCM, mono, 16 kHz
    AudioChunk {
        audio: String,
    },
    StopRecognition,
    Synthesize {
        text: String,
    },
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages the server sends.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Welcome {
        client_id: String,
    },
    /// The recognition upstream accepted the session
    Connected,
    RecognitionStarted {
        message: String,
    },
    /// Partial transcript
    #[serde(rename = "result")]
    Partial {
        text: String,
    },
    FinalResult {
        sentences: Vec<String>,
        full_text: String,
        count: usize,
    },
    AutoStopped,
    Stopped,
    Error {
        error: String,
    },
    SynthesisStarted {
        session_id: String,
        message: String,
    },
    /// Raw 16-bit PCM, mono, 24 kHz, base64 encoded
    AudioChunk {
        session_id: String,
        audio_data: String,
        chunk_number: u64,
        timestamp: f64,
    },
    SynthesisComplete {
        session_id: String,
        total_chunks: u64,
        timestamp: f64,
    },
    SynthesisError {
        session_id: Option<String>,
        error: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl GatewayMessage {
    pub fn error(error: &SessionError) -> Self {
        GatewayMessage::Error {
            error: error.to_string(),
        }
    }
}

/// Seconds since the epoch with millisecond precision, as browsers expect.
fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn epoch_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl From<SessionEvent> for GatewayMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::RecognitionConnected => GatewayMessage::Connected,
            SessionEvent::RecognitionStarted => GatewayMessage::RecognitionStarted {
                message: "recognition started, audio is being transcribed".to_string(),
            },
            SessionEvent::Partial { text } => GatewayMessage::Partial { text },
            SessionEvent::FinalResult { sentences } => GatewayMessage::FinalResult {
                full_text: sentences.join(" "),
                count: sentences.len(),
                sentences,
            },
            SessionEvent::Stopped { auto: true } => GatewayMessage::AutoStopped,
            SessionEvent::Stopped { auto: false } => GatewayMessage::Stopped,
            SessionEvent::RecognitionFailed { error } => GatewayMessage::error(&error),
            SessionEvent::SynthesisStarted { session_id } => GatewayMessage::SynthesisStarted {
                session_id: session_id.to_string(),
                message: "synthesis started".to_string(),
            },
            SessionEvent::AudioChunk {
                session_id,
                sequence,
                audio,
                at,
            } => GatewayMessage::AudioChunk {
                session_id: session_id.to_string(),
                audio_data: BASE64.encode(audio),
                chunk_number: sequence,
                timestamp: epoch_seconds(at),
            },
            SessionEvent::SynthesisComplete {
                session_id,
                total_chunks,
                at,
            } => GatewayMessage::SynthesisComplete {
                session_id: session_id.to_string(),
                total_chunks,
                timestamp: epoch_seconds(at),
            },
            SessionEvent::SynthesisFailed { session_id, error } => GatewayMessage::SynthesisError {
                session_id: session_id.map(|id| id.to_string()),
                error: error.to_string(),
            },
        }
    }
}

/// WebSocket actor for one browser connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. It holds no session state of its
/// own beyond the ids of the sessions it started; the sessions live in the
/// registry and report back through `events`.
pub struct GatewaySocket {
    client_id: ClientId,
    state: AppState,
    events_tx: EventSender,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    last_heartbeat: Instant,
    recognition: Option<SessionId>,
    synthesis: Option<SessionId>,
}

impl GatewaySocket {
    pub fn new(state: AppState) -> Self {
        let (events_tx, events_rx) = mpsc::channel(state.config.performance.event_channel_capacity);
        Self {
            client_id: ClientId::new(),
            state,
            events_tx,
            events_rx: Some(events_rx),
            last_heartbeat: Instant::now(),
            recognition: None,
            synthesis: None,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &GatewayMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(client_id = %self.client_id, "failed to serialize gateway message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, error: &SessionError) {
        debug!(client_id = %self.client_id, kind = error.kind(), "{}", error);
        self.send(ctx, &GatewayMessage::error(error));
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartRecognition => self.handle_start_recognition(ctx),
            ClientMessage::AudioChunk { audio } => match BASE64.decode(audio.as_bytes()) {
                Ok(pcm) => self.route_audio(pcm, ctx),
                Err(e) => self.send_error(ctx, &SessionError::ClientInput(format!("audio is not valid base64: {}", e))),
            },
            ClientMessage::StopRecognition => self.handle_stop_recognition(ctx),
            ClientMessage::Synthesize { text } => self.handle_synthesize(&text, ctx),
            ClientMessage::Ping { timestamp } => self.send(ctx, &GatewayMessage::Pong { timestamp }),
            ClientMessage::Pong { .. } => {}
        }
    }

    /// Replaces any running recognition session.
    ///
    /// The actor waits for the replacement to be registered before handling
    /// further messages, so audio sent right after the request is not lost.
    fn handle_start_recognition(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let start = start_recognition(self.state.sessions.clone(), self.client_id, self.events_tx.clone());
        ctx.wait(start.into_actor(self).map(|result, act, ctx| match result {
            Ok(session_id) => {
                info!(client_id = %act.client_id, %session_id, "recognition session started");
                act.recognition = Some(session_id);
            }
            Err(e) => act.send_error(ctx, &e),
        }));
    }

    fn handle_stop_recognition(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(handle) = self.state.registry().get(self.client_id, SessionKind::Recognition) else {
            self.send_error(
                ctx,
                &SessionError::InvalidTransition {
                    action: "stop",
                    state: "idle",
                },
            );
            return;
        };

        if let Err(e) = handle.stop() {
            self.send_error(ctx, &e);
        }
    }

    fn handle_synthesize(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match start_synthesis(&self.state.sessions, self.client_id, self.events_tx.clone(), text) {
            Ok(session_id) => self.synthesis = Some(session_id),
            Err(e) => {
                debug!(client_id = %self.client_id, kind = e.kind(), "synthesis rejected: {}", e);
                self.send(
                    ctx,
                    &GatewayMessage::SynthesisError {
                        session_id: self.synthesis.map(|id| id.to_string()),
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    /// Forward one PCM frame to the client's recognition session.
    ///
    /// Audio with no recognition session to receive it is rejected with an
    /// `error`. Only frames racing the end of this connection's own session
    /// are dropped quietly, since its final events are still on their way.
    fn route_audio(&mut self, pcm: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(e) = validate_pcm_frame(&pcm) {
            return self.send_error(ctx, &e);
        }

        let Some(handle) = self.state.registry().get(self.client_id, SessionKind::Recognition) else {
            self.state.metrics.audio_dropped();
            if self.recognition.is_some() {
                debug!(client_id = %self.client_id, bytes = pcm.len(), "audio after recognition ended dropped");
                return;
            }
            let state = match self.state.registry().get(self.client_id, SessionKind::Synthesis) {
                Some(_) => "synthesizing",
                None => "idle",
            };
            return self.send_error(
                ctx,
                &SessionError::InvalidTransition {
                    action: "send audio",
                    state,
                },
            );
        };

        match handle.send_audio(pcm) {
            Ok(()) => {}
            Err(SessionError::InvalidTransition { state: "closed", .. }) if self.recognition.is_some() => {
                self.state.metrics.audio_dropped();
                debug!(client_id = %self.client_id, "audio for a finished session dropped");
            }
            Err(e) => {
                self.state.metrics.audio_dropped();
                self.send_error(ctx, &e);
            }
        }
    }

    fn track(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Stopped { .. } | SessionEvent::RecognitionFailed { .. } => self.recognition = None,
            SessionEvent::SynthesisStarted { session_id } => self.synthesis = Some(*session_id),
            SessionEvent::SynthesisComplete { session_id, .. }
            | SessionEvent::SynthesisFailed {
                session_id: Some(session_id),
                ..
            } if self.synthesis == Some(*session_id) => self.synthesis = None,
            _ => {}
        }
    }
}

impl Actor for GatewaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "gateway connection started");

        if let Some(events) = self.events_rx.take() {
            ctx.add_stream(ReceiverStream::new(events));
        }
        self.state.clients.register(self.client_id, self.events_tx.clone());
        self.state.metrics.client_connected();

        self.send(
            ctx,
            &GatewayMessage::Welcome {
                client_id: self.client_id.to_string(),
            },
        );

        let interval = Duration::from_secs(self.state.config.heartbeat.interval_secs);
        let timeout = Duration::from_secs(self.state.config.heartbeat.timeout_secs);
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(client_id = %act.client_id, "heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
            act.send(ctx, &GatewayMessage::Ping { timestamp: epoch_millis() });
        });
    }

    /// Called when the WebSocket connection stops.
    ///
    /// Sessions are detached and signalled right here; only waiting for their
    /// upstream connections to close happens in the background.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.clients.unregister(self.client_id);
        self.state.metrics.client_disconnected();

        let handles = self.state.registry().take_client(self.client_id);
        for handle in &handles {
            handle.cancel();
        }
        info!(
            client_id = %self.client_id,
            sessions = handles.len(),
            recognition = ?self.recognition,
            synthesis = ?self.synthesis,
            "gateway connection stopped"
        );

        if handles.is_empty() {
            return;
        }
        let client_id = self.client_id;
        tokio::spawn(async move {
            for handle in handles {
                handle.finished().await;
                debug!(
                    %client_id,
                    session_id = %handle.session_id,
                    kind = %handle.kind,
                    age_ms = (Utc::now() - handle.created_at).num_milliseconds(),
                    "session torn down"
                );
            }
        });
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for GatewaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.handle_client_message(message, ctx),
                    Err(err) => self.send_error(ctx, &SessionError::ClientInput(format!("invalid message: {}", err))),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.route_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "client closed connection: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, "websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Session events on their way to the browser.
impl StreamHandler<SessionEvent> for GatewaySocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        self.track(&event);
        self.send(ctx, &GatewayMessage::from(event));
    }

    // The actor holds a sender itself, so the stream only ends with the actor.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a
/// WebSocket connection served by a fresh [`GatewaySocket`].
pub async fn gateway_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "websocket upgrade requested");
    ws::start(GatewaySocket::new(state.get_ref().clone()), &req, stream)
}
