//! Synthesis sessions: one request, one upstream connection, ordered audio out.
//!
//! ```text
//! Idle -> Synthesizing -> Streaming -> Complete
//!              \              \
//!               +--------------+--> Error
//! ```
//!
//! Single-flight per client comes from the registry: while a synthesis entry
//! exists for the client, a new request fails with `Busy` instead of queueing.

use super::registry::{SessionControl, SessionHandle};
use super::{ClientId, EventSender, SessionContext, SessionEvent, SessionId, SessionKind};
use crate::error::SessionError;
use crate::upstream::protocol;
use crate::upstream::{UpstreamLink, UpstreamMessage};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisState {
    Idle,
    Synthesizing,
    Streaming,
    Complete,
    Error,
}

impl SynthesisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisState::Idle => "idle",
            SynthesisState::Synthesizing => "synthesizing",
            SynthesisState::Streaming => "streaming",
            SynthesisState::Complete => "complete",
            SynthesisState::Error => "error",
        }
    }
}

/// Validate the request and start streaming synthesis for `client_id`.
///
/// Rejections (`ClientInput`, `Busy`, `Capacity`) happen synchronously and
/// leave any running synthesis untouched.
pub fn start_synthesis(
    ctx: &Arc<SessionContext>,
    client_id: ClientId,
    events: EventSender,
    text: &str,
) -> Result<SessionId, SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::ClientInput("text must not be empty".to_string()));
    }

    let handle = SessionHandle::new(client_id, SessionKind::Synthesis, SessionControl::Synthesis);
    ctx.registry.create(handle.clone())?;

    let session = SynthesisSession {
        ctx: ctx.clone(),
        client_id,
        session_id: handle.session_id,
        state: SynthesisState::Idle,
        text: text.to_string(),
        sequence: 0,
        events,
        cancel: handle.cancel_token(),
        link: None,
        _finished: handle.finished_token().drop_guard(),
    };

    let span = info_span!(
        "session",
        kind = "synthesis",
        client_id = %client_id,
        session_id = %handle.session_id
    );
    tokio::spawn(session.run().instrument(span));
    Ok(handle.session_id)
}

struct SynthesisSession {
    ctx: Arc<SessionContext>,
    client_id: ClientId,
    session_id: SessionId,
    state: SynthesisState,
    text: String,
    sequence: u64,
    events: EventSender,
    cancel: CancellationToken,
    link: Option<Box<dyn UpstreamLink>>,
    _finished: DropGuard,
}

impl SynthesisSession {
    async fn run(mut self) {
        info!(chars = self.text.chars().count(), "synthesis requested");
        self.state = SynthesisState::Synthesizing;
        self.emit(SessionEvent::SynthesisStarted {
            session_id: self.session_id,
        })
        .await;

        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.stream() => Some(result),
        };

        match outcome {
            None => self.abort().await,
            Some(Ok(())) => self.complete().await,
            Some(Err(e)) => self.fail(e).await,
        }
    }

    /// Connect, send the request and relay audio until the final frame.
    async fn stream(&mut self) -> Result<(), SessionError> {
        let url = self.ctx.signers.synthesis.signed_url(Utc::now())?;
        self.link = Some(self.ctx.open_upstream(&url).await?);

        let request = protocol::encode_synthesis_request(self.ctx.signers.synthesis.app_id(), &self.ctx.voice, &self.text)?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| SessionError::UpstreamTransport("no upstream connection".to_string()))?;
        link.send(UpstreamMessage::Text(request)).await?;
        debug!("synthesis request sent");

        loop {
            let raw = match link.recv().await {
                Some(Ok(UpstreamMessage::Text(raw))) => raw,
                Some(Ok(UpstreamMessage::Binary(bytes))) => {
                    debug!(len = bytes.len(), "ignoring binary frame from synthesis upstream");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(SessionError::UpstreamTransport(
                        "upstream closed before synthesis completed".to_string(),
                    ))
                }
            };

            let frame = protocol::decode_synthesis_frame(&raw)?;
            if let Some(audio) = frame.audio {
                self.state = SynthesisState::Streaming;
                self.sequence += 1;
                self.ctx.metrics.audio_frame_down();
                let event = SessionEvent::AudioChunk {
                    session_id: self.session_id,
                    sequence: self.sequence,
                    audio,
                    at: Utc::now(),
                };
                if self.events.send(event).await.is_err() {
                    debug!("client channel closed, audio chunk dropped");
                }
            }
            if frame.is_final {
                return Ok(());
            }
        }
    }

    async fn complete(&mut self) {
        self.state = SynthesisState::Complete;
        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Synthesis, self.session_id);
        self.ctx.metrics.session_completed(SessionKind::Synthesis);

        info!(total_chunks = self.sequence, "synthesis complete");
        self.emit(SessionEvent::SynthesisComplete {
            session_id: self.session_id,
            total_chunks: self.sequence,
            at: Utc::now(),
        })
        .await;
    }

    async fn fail(&mut self, error: SessionError) {
        warn!(
            error = %error,
            kind = error.kind(),
            state = self.state.as_str(),
            chunks = self.sequence,
            "synthesis failed"
        );
        self.state = SynthesisState::Error;
        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Synthesis, self.session_id);
        self.ctx.metrics.session_failed(SessionKind::Synthesis);

        self.emit(SessionEvent::SynthesisFailed {
            session_id: Some(self.session_id),
            error,
        })
        .await;
    }

    async fn abort(&mut self) {
        debug!(state = self.state.as_str(), "synthesis cancelled");
        self.release().await;
        self.ctx
            .registry
            .remove_if(self.client_id, SessionKind::Synthesis, self.session_id);
    }

    async fn release(&mut self) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::Harness;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::{json, Value};

    fn audio_frame(pcm: &[u8], status: i64) -> String {
        json!({
            "header": {"code": 0, "message": "success", "sid": "tts01", "status": status},
            "payload": {"audio": {"audio": BASE64.encode(pcm), "seq": 1, "status": status}}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_streams_chunks_in_order() {
        let mut h = Harness::new();
        let session_id = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "你好").unwrap();
        let mut upstream = h.next_upstream().await;
        assert!(upstream.url.contains("authorization="));

        let request = match upstream.next_sent().await {
            Some(UpstreamMessage::Text(raw)) => raw,
            other => panic!("expected request frame, got {:?}", other),
        };
        let request: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(request["header"]["app_id"], "testapp");
        assert_eq!(request["payload"]["text"]["text"], "5L2g5aW9");

        upstream.push_text(audio_frame(&[1, 1], 1));
        upstream.push_text(audio_frame(&[2, 2], 1));
        upstream.push_text(audio_frame(&[3, 3], 2));

        assert_eq!(h.next_event().await, SessionEvent::SynthesisStarted { session_id });
        for (expected_seq, expected_audio) in [(1, vec![1u8, 1]), (2, vec![2, 2]), (3, vec![3, 3])] {
            match h.next_event().await {
                SessionEvent::AudioChunk {
                    session_id: id,
                    sequence,
                    audio,
                    ..
                } => {
                    assert_eq!(id, session_id);
                    assert_eq!(sequence, expected_seq);
                    assert_eq!(audio, expected_audio);
                }
                other => panic!("expected audio chunk, got {:?}", other),
            }
        }
        match h.next_event().await {
            SessionEvent::SynthesisComplete { total_chunks, .. } => assert_eq!(total_chunks, 3),
            other => panic!("expected completion, got {:?}", other),
        }

        assert!(upstream.is_closed());
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.ctx.metrics.snapshot().synthesis_completed, 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let mut h = Harness::new();
        let first = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "first").unwrap();
        let upstream = h.next_upstream().await;

        let err = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "second").unwrap_err();
        assert_eq!(
            err,
            SessionError::Busy {
                session_id: first.to_string()
            }
        );
        assert_eq!(h.connector.attempts(), 1);

        // Once the first completes, a new request gets a fresh session and connection.
        upstream.push_text(audio_frame(&[0, 0], 2));
        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert!(matches!(h.next_event().await, SessionEvent::AudioChunk { .. }));
        assert!(matches!(h.next_event().await, SessionEvent::SynthesisComplete { .. }));

        let second = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "second").unwrap();
        assert_ne!(first, second);
        let _upstream = h.next_upstream().await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let h = Harness::new();
        let err = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "   ").unwrap_err();
        assert!(matches!(err, SessionError::ClientInput(_)));
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_code_fails_request() {
        let mut h = Harness::new();
        let session_id = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "hello").unwrap();
        let upstream = h.next_upstream().await;
        upstream.push_text(audio_frame(&[9, 9], 1));
        upstream.push_text(json!({"header": {"code": 10163, "message": "text too long", "status": 2}}).to_string());

        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert!(matches!(h.next_event().await, SessionEvent::AudioChunk { sequence: 1, .. }));
        assert_eq!(
            h.next_event().await,
            SessionEvent::SynthesisFailed {
                session_id: Some(session_id),
                error: SessionError::UpstreamProtocol {
                    code: 10163,
                    message: "text too long".to_string()
                }
            }
        );
        assert!(upstream.is_closed());
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_premature_close_is_an_error() {
        let mut h = Harness::new();
        start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "hello").unwrap();
        let upstream = h.next_upstream().await;
        upstream.hang_up();

        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert!(matches!(
            h.next_event().await,
            SessionEvent::SynthesisFailed {
                error: SessionError::UpstreamTransport(_),
                ..
            }
        ));
        assert_eq!(h.connector.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let mut h = Harness::new();
        start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "hello").unwrap();
        let upstream = h.next_upstream().await;
        upstream.push_text(audio_frame(&[4, 4], 1));
        upstream.push_error(SessionError::UpstreamTransport("connection reset".to_string()));

        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert!(matches!(h.next_event().await, SessionEvent::AudioChunk { sequence: 1, .. }));
        assert!(matches!(
            h.next_event().await,
            SessionEvent::SynthesisFailed {
                error: SessionError::UpstreamTransport(_),
                ..
            }
        ));
        assert!(upstream.is_closed());
        assert_eq!(h.ctx.metrics.snapshot().synthesis_failed, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_session() {
        let mut h = Harness::new();
        h.connector.fail_with("dns failure");
        let session_id = start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "hello").unwrap();

        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert_eq!(
            h.next_event().await,
            SessionEvent::SynthesisFailed {
                session_id: Some(session_id),
                error: SessionError::UpstreamConnect("dns failure".to_string())
            }
        );
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_closes_upstream() {
        let mut h = Harness::new();
        start_synthesis(&h.ctx, h.client, h.events_tx.clone(), "a long story").unwrap();
        let upstream = h.next_upstream().await;
        upstream.push_text(audio_frame(&[1, 1], 1));
        assert!(matches!(h.next_event().await, SessionEvent::SynthesisStarted { .. }));
        assert!(matches!(h.next_event().await, SessionEvent::AudioChunk { .. }));

        h.ctx.registry.shutdown(h.client, SessionKind::Synthesis).await;
        assert!(upstream.is_closed());
        assert!(h.ctx.registry.is_empty());
        assert!(h.events.try_recv().is_err());
    }
}
