//! # Application State Management
//!
//! This module holds everything that is shared between HTTP handlers, WebSocket
//! actors and session tasks.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many owners share the same data
//! - **Why needed**: Every browser connection, HTTP request and session task needs
//!   the registry, the metrics and the configuration at the same time
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why std and not tokio**: The locks below are only held for a few
//!   instructions and never across an `.await`, so a blocking lock is cheaper
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership
//! - **RwLock**: Thread-safe read/write access
//! - **T**: The data being protected
//!
//! ## What lives here:
//! - **AppState**: The bundle handed to actix as `web::Data`
//! - **MetricsRecorder**: Counters for connections, sessions and relayed audio
//! - **ClientDirectory**: Which browser connections are currently open

use crate::config::AppConfig;
use crate::error::SessionError;
use crate::session::{ClientId, EventSender, SessionContext, SessionKind, SessionRegistry};
use crate::upstream::{UpstreamConnector, UrlSigners};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across handlers and actors.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only bumps reference counts, every clone
///   sees the same registry and metrics
/// - **Instant**: A point in time (for measuring uptime)
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration. Read-only after startup.
    pub config: Arc<AppConfig>,

    /// Counters updated by sessions and gateway actors.
    pub metrics: MetricsRecorder,

    /// Everything a session task needs, including the Session Registry.
    pub sessions: Arc<SessionContext>,

    /// Open browser connections and their event channels.
    pub clients: ClientDirectory,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Counters collected across all sessions and connections.
///
/// ## Why these metrics matter:
/// - **connected_clients**: Current browser connections (capacity planning)
/// - **upstream_opened / upstream_closed**: Must converge; a growing gap is a connection leak
/// - **\*_completed / \*_failed**: Session outcomes per kind (reliability)
/// - **audio_frames_\***: Relay volume in each direction, plus frames we had to drop
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub connected_clients: u64,
    pub total_connections: u64,
    pub upstream_opened: u64,
    pub upstream_closed: u64,
    pub recognition_completed: u64,
    pub recognition_failed: u64,
    pub synthesis_completed: u64,
    pub synthesis_failed: u64,
    pub audio_frames_up: u64,
    pub audio_frames_down: u64,
    pub audio_frames_dropped: u64,
}

impl AppMetrics {
    /// Upstream connections currently open.
    pub fn upstream_open(&self) -> u64 {
        self.upstream_opened.saturating_sub(self.upstream_closed)
    }

    /// Share of finished sessions that failed (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        let failed = self.recognition_failed + self.synthesis_failed;
        let total = failed + self.recognition_completed + self.synthesis_completed;
        if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Thread-safe handle to [`AppMetrics`].
///
/// ## Thread Safety:
/// Every method takes the write lock for a single increment. A poisoned lock
/// only means another thread panicked mid-increment, so the counters are
/// still usable and we keep going with `PoisonError::into_inner`.
#[derive(Debug, Default, Clone)]
pub struct MetricsRecorder {
    inner: Arc<RwLock<AppMetrics>>,
}

impl MetricsRecorder {
    fn update(&self, f: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    pub fn client_connected(&self) {
        self.update(|m| {
            m.connected_clients += 1;
            m.total_connections += 1;
        });
    }

    /// Includes underflow protection in case of a double disconnect.
    pub fn client_disconnected(&self) {
        self.update(|m| m.connected_clients = m.connected_clients.saturating_sub(1));
    }

    pub fn upstream_opened(&self) {
        self.update(|m| m.upstream_opened += 1);
    }

    pub fn upstream_closed(&self) {
        self.update(|m| m.upstream_closed += 1);
    }

    pub fn session_completed(&self, kind: SessionKind) {
        self.update(|m| match kind {
            SessionKind::Recognition => m.recognition_completed += 1,
            SessionKind::Synthesis => m.synthesis_completed += 1,
        });
    }

    pub fn session_failed(&self, kind: SessionKind) {
        self.update(|m| match kind {
            SessionKind::Recognition => m.recognition_failed += 1,
            SessionKind::Synthesis => m.synthesis_failed += 1,
        });
    }

    pub fn audio_frame_up(&self) {
        self.update(|m| m.audio_frames_up += 1);
    }

    pub fn audio_frame_down(&self) {
        self.update(|m| m.audio_frames_down += 1);
    }

    pub fn audio_dropped(&self) {
        self.update(|m| m.audio_frames_dropped += 1);
    }

    /// Copy of the counters, taken under a read lock.
    pub fn snapshot(&self) -> AppMetrics {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Connected browser clients and where to deliver their events.
///
/// The HTTP synthesis endpoint uses this to stream audio to a client that is
/// connected over `/ws`.
#[derive(Debug, Default, Clone)]
pub struct ClientDirectory {
    inner: Arc<RwLock<HashMap<ClientId, EventSender>>>,
}

impl ClientDirectory {
    pub fn register(&self, client: ClientId, events: EventSender) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, events);
    }

    pub fn unregister(&self, client: ClientId) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client)
            .is_some()
    }

    pub fn sender(&self, client: ClientId) -> Option<EventSender> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl AppState {
    /// Build the shared state from a validated configuration.
    ///
    /// ## What this does:
    /// 1. Builds the URL signers (fails on missing credentials)
    /// 2. Creates the session context and its sharded registry
    /// 3. Records the current time as the server start time
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Result<Self, SessionError> {
        let signers = UrlSigners::from_config(&config.upstream)?;
        let metrics = MetricsRecorder::default();
        let sessions = Arc::new(SessionContext::new(&config, connector, signers, metrics.clone()));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            sessions,
            clients: ClientDirectory::default(),
            start_time: Instant::now(),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.sessions.registry
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::upstream::mock::MockConnector;
    use tokio::sync::mpsc;

    #[test]
    fn test_metrics_counters() {
        let metrics = MetricsRecorder::default();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        metrics.upstream_opened();
        metrics.session_completed(SessionKind::Recognition);
        metrics.session_failed(SessionKind::Synthesis);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connected_clients, 1);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.upstream_open(), 1);
        assert_eq!(snapshot.failure_rate(), 0.5);
    }

    #[test]
    fn test_disconnect_never_underflows() {
        let metrics = MetricsRecorder::default();
        metrics.client_disconnected();
        assert_eq!(metrics.snapshot().connected_clients, 0);
    }

    #[test]
    fn test_client_directory() {
        let directory = ClientDirectory::default();
        let client = ClientId::new();
        let (tx, _rx) = mpsc::channel(1);

        directory.register(client, tx);
        assert!(directory.sender(client).is_some());
        assert!(directory.sender(ClientId::new()).is_none());
        assert!(directory.unregister(client));
        assert!(!directory.unregister(client));
        assert_eq!(directory.len(), 0);
    }

    #[test]
    fn test_state_requires_credentials() {
        let (connector, _accepted) = MockConnector::new();
        assert!(AppState::new(test_config(), connector.clone()).is_ok());

        let mut config = test_config();
        config.upstream.synthesis.api_secret.clear();
        assert!(matches!(
            AppState::new(config, connector),
            Err(SessionError::Configuration(_))
        ));
    }
}
