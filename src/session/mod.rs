//! # Speech Sessions
//!
//! A session owns exactly one upstream connection and drives it from a single
//! tokio task. Browser connections never touch a session's internals; they talk
//! to it through the [`SessionRegistry`] and receive [`SessionEvent`]s back on
//! a bounded channel.
//!
//! ## Key Components:
//! - **Registry**: Sharded `(client, kind) -> handle` map (`registry.rs`)
//! - **Recognition**: Microphone audio in, transcripts out (`recognition.rs`)
//! - **Synthesis**: Text in, ordered audio chunks out (`synthesis.rs`)
//! - **Transcript / Endpoint**: Sentence extraction and the silence monitor
//!
//! ## Teardown contract:
//! Whatever ends a session (stop, auto-stop, error, disconnect), its task
//! closes the upstream link and stops the silence monitor, then removes its own
//! registry entry, and only then reports completion through the handle.

use crate::config::{AppConfig, VoiceConfig};
use crate::error::SessionError;
use crate::state::MetricsRecorder;
use crate::upstream::{UpstreamConnector, UpstreamLink, UrlSigners};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod endpoint;
pub mod recognition;
pub mod registry;
pub mod synthesis;
pub mod transcript;

pub use endpoint::EndpointPolicy;
pub use recognition::{start_recognition, validate_pcm_frame};
pub use registry::SessionRegistry;
pub use synthesis::start_synthesis;

/// Identity of one browser connection.
///
/// Each connection gets its own id, so two tabs of the same user hold
/// independent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one session instance, unique across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Recognition,
    Synthesis,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Recognition => "recognition",
            SessionKind::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session reports back to its client, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The recognition upstream acknowledged the session.
    RecognitionConnected,
    /// Audio is now being forwarded upstream.
    RecognitionStarted,
    Partial {
        text: String,
    },
    FinalResult {
        sentences: Vec<String>,
    },
    Stopped {
        auto: bool,
    },
    RecognitionFailed {
        error: SessionError,
    },
    SynthesisStarted {
        session_id: SessionId,
    },
    AudioChunk {
        session_id: SessionId,
        sequence: u64,
        audio: Vec<u8>,
        at: DateTime<Utc>,
    },
    SynthesisComplete {
        session_id: SessionId,
        total_chunks: u64,
        at: DateTime<Utc>,
    },
    SynthesisFailed {
        session_id: Option<SessionId>,
        error: SessionError,
    },
}

pub type EventSender = mpsc::Sender<SessionEvent>;

/// Shared dependencies of every session task.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub signers: Arc<UrlSigners>,
    pub endpointing: EndpointPolicy,
    pub voice: VoiceConfig,
    pub connect_timeout: Duration,
    pub command_capacity: usize,
    pub pending_audio_frames: usize,
    pub metrics: MetricsRecorder,
}

impl SessionContext {
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn UpstreamConnector>,
        signers: UrlSigners,
        metrics: MetricsRecorder,
    ) -> Self {
        let performance = &config.performance;
        Self {
            registry: Arc::new(SessionRegistry::new(
                performance.registry_shards,
                performance.max_concurrent_sessions,
            )),
            connector,
            signers: Arc::new(signers),
            endpointing: EndpointPolicy::from_config(&config.endpointing),
            voice: config.upstream.synthesis.voice.clone(),
            connect_timeout: performance.connect_timeout(),
            command_capacity: performance.command_channel_capacity,
            pending_audio_frames: performance.pending_audio_frames,
            metrics,
        }
    }

    /// Open an upstream link, bounded by the configured connect timeout.
    pub(crate) async fn open_upstream(&self, url: &str) -> Result<Box<dyn UpstreamLink>, SessionError> {
        let link = tokio::time::timeout(self.connect_timeout, self.connector.connect(url))
            .await
            .map_err(|_| {
                SessionError::UpstreamConnect(format!("timed out after {}s", self.connect_timeout.as_secs()))
            })??;
        self.metrics.upstream_opened();
        Ok(link)
    }

    /// Close a link previously returned by [`open_upstream`](Self::open_upstream).
    pub(crate) async fn close_upstream(&self, mut link: Box<dyn UpstreamLink>) {
        link.close().await;
        self.metrics.upstream_closed();
    }
}
