//! Scripted in-memory upstream for tests.
//!
//! Every accepted connection is handed to the test as a [`MockUpstream`]
//! through the receiver returned by [`MockConnector::new`]. The test then
//! plays the upstream side: it pushes frames to the session and inspects
//! what the session sent.

use super::{UpstreamConnector, UpstreamLink, UpstreamMessage};
use crate::error::SessionError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Inbound = Option<Result<UpstreamMessage, SessionError>>;

#[derive(Debug, Clone)]
enum ConnectMode {
    Accept,
    Fail(String),
    Hang,
}

pub struct MockConnector {
    accepted: mpsc::UnboundedSender<MockUpstream>,
    mode: Mutex<ConnectMode>,
    live: Arc<AtomicUsize>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockUpstream>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            mode: Mutex::new(ConnectMode::Accept),
            live: Arc::new(AtomicUsize::new(0)),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Refuse every following connection attempt.
    pub fn fail_with(&self, reason: &str) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = ConnectMode::Fail(reason.to_string());
    }

    /// Never complete following connection attempts.
    pub fn hang(&self) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = ConnectMode::Hang;
    }

    /// Connections opened and not yet closed by their session.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamLink>, SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner).clone();

        match mode {
            ConnectMode::Fail(reason) => return Err(SessionError::UpstreamConnect(reason)),
            ConnectMode::Hang => std::future::pending::<()>().await,
            ConnectMode::Accept => {}
        }

        let (to_session, inbound) = mpsc::unbounded_channel();
        let (outbound, from_session) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let stalled = Arc::new(AtomicBool::new(false));

        self.live.fetch_add(1, Ordering::SeqCst);
        let handle = MockUpstream {
            url: url.to_string(),
            to_session,
            from_session,
            closed: closed.clone(),
            stalled: stalled.clone(),
        };
        // A test that dropped its receiver just doesn't script this link.
        let _ = self.accepted.send(handle);

        Ok(Box::new(MockLink {
            inbound,
            outbound,
            closed,
            stalled,
            live: self.live.clone(),
        }))
    }
}

/// The test's end of one accepted connection.
pub struct MockUpstream {
    pub url: String,
    to_session: mpsc::UnboundedSender<Inbound>,
    from_session: mpsc::UnboundedReceiver<UpstreamMessage>,
    closed: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

impl MockUpstream {
    pub fn push_text(&self, frame: impl Into<String>) {
        let _ = self.to_session.send(Some(Ok(UpstreamMessage::Text(frame.into()))));
    }

    pub fn push_error(&self, error: SessionError) {
        let _ = self.to_session.send(Some(Err(error)));
    }

    /// Simulate the upstream closing the connection.
    pub fn hang_up(&self) {
        let _ = self.to_session.send(None);
    }

    /// Next message the session sent, or `None` once the link is gone.
    pub async fn next_sent(&mut self) -> Option<UpstreamMessage> {
        self.from_session.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop reading: every following send from the session never completes.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

struct MockLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<UpstreamMessage>,
    closed: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl UpstreamLink for MockLink {
    async fn send(&mut self, message: UpstreamMessage) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::UpstreamTransport("connection already closed".to_string()));
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let _ = self.outbound.send(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<UpstreamMessage, SessionError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.inbound.recv().await.flatten()
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
