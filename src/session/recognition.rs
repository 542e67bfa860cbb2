//! Recognition sessions: browser microphone audio in, transcripts out.
//!
//! ```text
//! Created -> Connecting -> Started -> Recording -> Stopping -> Closed
//!                 \            \           \           \
//!                  +------------+-----------+-----------+--> Error -> Closed
//! ```
//!
//! One task per session owns the upstream link, the transcript log and the
//! pending-audio queue. Every input (client command, upstream frame, silence
//! trigger, cancellation) is turned into an [`Input`] and handled by
//! `dispatch`, so state changes happen in exactly one place.

use super::endpoint::spawn_silence_monitor;
use super::registry::{SessionControl, SessionHandle};
use super::transcript::TranscriptLog;
use super::{ClientId, EventSender, SessionContext, SessionEvent, SessionId, SessionKind};
use crate::error::SessionError;
use crate::upstream::protocol::{self, RecognitionFrame};
use crate::upstream::{UpstreamLink, UpstreamMessage};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionState {
    Created,
    Connecting,
    Started,
    Recording,
    Stopping,
    Closed,
    Error,
}

impl RecognitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionState::Created => "created",
            RecognitionState::Connecting => "connecting",
            RecognitionState::Started => "started",
            RecognitionState::Recording => "recording",
            RecognitionState::Stopping => "stopping",
            RecognitionState::Closed => "closed",
            RecognitionState::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: RecognitionState) -> bool {
        use RecognitionState::*;
        match (self, next) {
            (Created, Connecting) | (Connecting, Started) | (Started, Recording) => true,
            // A stop before the upstream acknowledged still yields a (possibly empty) result.
            (Connecting | Started | Recording, Stopping) => true,
            (Error, Closed) => true,
            (Error, _) | (Closed, _) => false,
            (_, Error) | (_, Closed) => true,
            _ => false,
        }
    }
}

/// Commands accepted by a running recognition session.
#[derive(Debug)]
pub enum RecognitionCommand {
    Audio(Vec<u8>),
    Stop,
}

enum Input {
    Command(Option<RecognitionCommand>),
    Upstream(Option<Result<UpstreamMessage, SessionError>>),
    AutoStop,
    HandshakeTimeout,
    Cancelled,
}

enum Flow {
    Continue,
    Done,
}

/// Reject frames that cannot be 16-bit PCM.
pub fn validate_pcm_frame(pcm: &[u8]) -> Result<(), SessionError> {
    if pcm.is_empty() {
        return Err(SessionError::ClientInput("empty audio frame".to_string()));
    }
    if pcm.len() % 2 != 0 {
        return Err(SessionError::ClientInput(format!(
            "audio frame of {} bytes is not whole 16-bit samples",
            pcm.len()
        )));
    }
    Ok(())
}

/// Start a recognition session for `client_id`, replacing any running one.
///
/// The previous session is torn down completely (upstream closed, registry
/// entry gone) before the new one is registered.
pub async fn start_recognition(
    ctx: Arc<SessionContext>,
    client_id: ClientId,
    events: EventSender,
) -> Result<SessionId, SessionError> {
    if ctx.registry.shutdown(client_id, SessionKind::Recognition).await {
        info!(%client_id, "replaced running recognition session");
    }
    spawn_recognition(&ctx, client_id, events).map(|handle| handle.session_id)
}

/// Register a recognition session and spawn its task.
pub fn spawn_recognition(
    ctx: &Arc<SessionContext>,
    client_id: ClientId,
    events: EventSender,
) -> Result<SessionHandle, SessionError> {
    let (commands_tx, commands) = mpsc::channel(ctx.command_capacity);
    let handle = SessionHandle::new(client_id, SessionKind::Recognition, SessionControl::Recognition(commands_tx));
    ctx.registry.create(handle.clone())?;

    let (auto_stop_tx, auto_stop_rx) = mpsc::channel(1);
    let session = RecognitionSession {
        ctx: ctx.clone(),
        client_id,
        session_id: handle.session_id,
        state: RecognitionState::Created,
        events,
        commands,
        cancel: handle.cancel_token(),
        link: None,
        pending: VecDeque::new(),
        transcript: TranscriptLog::new(),
        last_update: None,
        monitor: None,
        auto_stop_tx,
        auto_stop_rx,
        _finished: handle.finished_token().drop_guard(),
    };

    let span = info_span!(
        "session",
        kind = "recognition",
        client_id = %client_id,
        session_id = %handle.session_id
    );
    tokio::spawn(session.run().instrument(span));
    Ok(handle)
}

struct RecognitionSession {
    ctx: Arc<SessionContext>,
    client_id: ClientId,
    session_id: SessionId,
    state: RecognitionState,
    events: EventSender,
    commands: mpsc::Receiver<RecognitionCommand>,
    cancel: CancellationToken,
    link: Option<Box<dyn UpstreamLink>>,
    pending: VecDeque<Vec<u8>>,
    transcript: TranscriptLog,
    last_update: Option<watch::Sender<Instant>>,
    monitor: Option<(JoinHandle<()>, CancellationToken)>,
    auto_stop_tx: mpsc::Sender<()>,
    auto_stop_rx: mpsc::Receiver<()>,
    // Declared last: completion is signalled after everything else is dropped.
    _finished: DropGuard,
}

/// Cancel-safe read from an optional link; pends forever without one.
async fn next_frame(link: &mut Option<Box<dyn UpstreamLink>>) -> Option<Result<UpstreamMessage, SessionError>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

impl RecognitionSession {
    async fn run(mut self) {
        debug!("recognition session created");
        if let Err(e) = self.transition(RecognitionState::Connecting) {
            return self.fail(e).await;
        }

        // One deadline covers both the socket handshake and the start acknowledgement.
        let handshake_deadline = Instant::now() + self.ctx.connect_timeout;
        let url = match self.ctx.signers.recognition.signed_url(Utc::now()) {
            Ok(url) => url,
            Err(e) => return self.fail(e).await,
        };

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.ctx.open_upstream(&url) => Some(result),
        };
        match connected {
            None => return self.abort().await,
            Some(Err(e)) => return self.fail(e).await,
            Some(Ok(link)) => self.link = Some(link),
        }
        debug!("upstream connected, waiting for start acknowledgement");

        loop {
            let awaiting_ack = self.state == RecognitionState::Connecting;
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Input::Cancelled,
                frame = next_frame(&mut self.link) => Input::Upstream(frame),
                Some(()) = self.auto_stop_rx.recv() => Input::AutoStop,
                _ = tokio::time::sleep_until(handshake_deadline), if awaiting_ack => Input::HandshakeTimeout,
                command = self.commands.recv() => Input::Command(command),
            };

            match self.dispatch(input).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => break,
                Err(e) if e.is_client_fault() => {
                    debug!(error = %e, "rejected client command");
                    self.emit(SessionEvent::RecognitionFailed { error: e }).await;
                }
                Err(e) => {
                    self.fail(e).await;
                    break;
                }
            }
        }
    }

    async fn dispatch(&mut self, input: Input) -> Result<Flow, SessionError> {
        match input {
            // Senders only all disappear once the registry let go of us.
            Input::Cancelled | Input::Command(None) => {
                self.abort().await;
                Ok(Flow::Done)
            }
            Input::Command(Some(RecognitionCommand::Audio(pcm))) => {
                self.on_audio(pcm).await?;
                Ok(Flow::Continue)
            }
            Input::Command(Some(RecognitionCommand::Stop)) => {
                self.finish(false).await?;
                Ok(Flow::Done)
            }
            Input::AutoStop => {
                info!("no new speech, stopping automatically");
                self.finish(true).await?;
                Ok(Flow::Done)
            }
            Input::HandshakeTimeout => Err(SessionError::UpstreamConnect(format!(
                "no start acknowledgement within {}s",
                self.ctx.connect_timeout.as_secs()
            ))),
            Input::Upstream(None) => Err(SessionError::UpstreamTransport(
                "upstream closed the connection".to_string(),
            )),
            Input::Upstream(Some(Err(e))) => Err(e),
            Input::Upstream(Some(Ok(UpstreamMessage::Text(raw)))) => {
                self.on_frame(&raw).await?;
                Ok(Flow::Continue)
            }
            Input::Upstream(Some(Ok(UpstreamMessage::Binary(bytes)))) => {
                debug!(len = bytes.len(), "ignoring binary frame from recognition upstream");
                Ok(Flow::Continue)
            }
        }
    }

    fn transition(&mut self, next: RecognitionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                action: transition_action(next),
                state: self.state.as_str(),
            });
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "state change");
        self.state = next;
        Ok(())
    }

    async fn on_audio(&mut self, pcm: Vec<u8>) -> Result<(), SessionError> {
        match self.state {
            RecognitionState::Recording => self.forward_audio(pcm).await,
            RecognitionState::Connecting | RecognitionState::Started => {
                self.queue_audio(pcm);
                Ok(())
            }
            other => Err(SessionError::InvalidTransition {
                action: "send audio",
                state: other.as_str(),
            }),
        }
    }

    fn queue_audio(&mut self, pcm: Vec<u8>) {
        let limit = self.ctx.pending_audio_frames;
        if limit == 0 {
            self.ctx.metrics.audio_dropped();
            return;
        }
        if self.pending.len() >= limit {
            self.pending.pop_front();
            self.ctx.metrics.audio_dropped();
            warn!(limit, "upstream not ready, dropping oldest queued audio frame");
        }
        self.pending.push_back(pcm);
    }

    async fn forward_audio(&mut self, pcm: Vec<u8>) -> Result<(), SessionError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| SessionError::UpstreamTransport("no upstream connection".to_string()))?;
        link.send(protocol::audio_frame(pcm)).await?;
        self.ctx.metrics.audio_frame_up();
        Ok(())
    }

    async fn on_frame(&mut self, raw: &str) -> Result<(), SessionError> {
        match protocol::decode_recognition_frame(raw)? {
            RecognitionFrame::Started { sid } => {
                if self.state != RecognitionState::Connecting {
                    debug!("duplicate start acknowledgement ignored");
                    return Ok(());
                }
                self.transition(RecognitionState::Started)?;
                info!(sid = sid.as_deref().unwrap_or("-"), "recognition upstream started");
                self.emit(SessionEvent::RecognitionConnected).await;
                self.begin_recording().await?;
            }
            RecognitionFrame::Partial(text) => {
                if self.state != RecognitionState::Recording {
                    debug!(state = self.state.as_str(), "partial outside recording ignored");
                    return Ok(());
                }
                if self.transcript.record(&text) {
                    if let Some(last_update) = &self.last_update {
                        last_update.send_replace(Instant::now());
                    }
                    self.emit(SessionEvent::Partial { text }).await;
                }
            }
            RecognitionFrame::Failed { code, message } => {
                return Err(SessionError::UpstreamProtocol { code, message });
            }
            RecognitionFrame::Other => {}
        }
        Ok(())
    }

    async fn begin_recording(&mut self) -> Result<(), SessionError> {
        self.transition(RecognitionState::Recording)?;

        let started = Instant::now();
        let (last_tx, last_rx) = watch::channel(started);
        let monitor_cancel = self.cancel.child_token();
        let monitor = spawn_silence_monitor(
            self.ctx.endpointing,
            started,
            last_rx,
            self.auto_stop_tx.clone(),
            monitor_cancel.clone(),
        );
        self.last_update = Some(last_tx);
        self.monitor = Some((monitor, monitor_cancel));

        self.emit(SessionEvent::RecognitionStarted).await;

        if !self.pending.is_empty() {
            debug!(frames = self.pending.len(), "flushing audio queued during start");
        }
        while let Some(pcm) = self.pending.pop_front() {
            self.forward_audio(pcm).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, auto: bool) -> Result<(), SessionError> {
        self.transition(RecognitionState::Stopping)?;

        if let Some(link) = self.link.as_mut() {
            match tokio::time::timeout(self.ctx.connect_timeout, link.send(protocol::end_of_stream_marker())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to send end-of-stream marker"),
                Err(_) => warn!("upstream stalled, end-of-stream marker not sent"),
            }
        }

        let sentences = self.transcript.sentences();
        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Recognition, self.session_id);
        self.state = RecognitionState::Closed;
        self.ctx.metrics.session_completed(SessionKind::Recognition);

        info!(
            auto,
            partials = self.transcript.len(),
            last_partial_at = ?self.transcript.last_observed(),
            sentences = sentences.len(),
            "recognition finished"
        );
        self.emit(SessionEvent::FinalResult { sentences }).await;
        self.emit(SessionEvent::Stopped { auto }).await;
        Ok(())
    }

    async fn fail(&mut self, error: SessionError) {
        warn!(error = %error, kind = error.kind(), state = self.state.as_str(), "recognition session failed");
        if self.state.can_transition_to(RecognitionState::Error) {
            self.state = RecognitionState::Error;
        }

        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Recognition, self.session_id);
        self.state = RecognitionState::Closed;
        self.ctx.metrics.session_failed(SessionKind::Recognition);

        self.emit(SessionEvent::RecognitionFailed { error }).await;
    }

    /// Silent teardown: the client is gone or replaced this session.
    async fn abort(&mut self) {
        debug!(state = self.state.as_str(), "recognition session cancelled");
        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Recognition, self.session_id);
        self.state = RecognitionState::Closed;
    }

    async fn release(&mut self) {
        if let Some((monitor, cancel)) = self.monitor.take() {
            cancel.cancel();
            if let Err(e) = monitor.await {
                warn!("silence monitor ended abnormally: {}", e);
            }
        }
        self.last_update = None;
        self.pending.clear();

        if let Some(link) = self.link.take() {
            self.ctx.close_upstream(link).await;
        }
    }

    /// Deliver an event; gives up once the session is cancelled so a client
    /// that stopped draining its channel cannot hold up teardown.
    async fn emit(&mut self, event: SessionEvent) {
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("client channel closed, event dropped");
                }
            }
            _ = self.cancel.cancelled() => debug!("session cancelled, event dropped"),
        }
    }
}

fn transition_action(next: RecognitionState) -> &'static str {
    match next {
        RecognitionState::Connecting => "connect",
        RecognitionState::Started => "start",
        RecognitionState::Recording => "record",
        RecognitionState::Stopping => "stop",
        RecognitionState::Closed => "close",
        RecognitionState::Error => "fail",
        RecognitionState::Created => "create",
    }
}
