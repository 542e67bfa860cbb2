//! # Upstream Speech Cloud
//!
//! Everything needed to talk to the upstream streaming speech service, with no
//! knowledge of browser clients or session lifecycles.
//!
//! ## Key Components:
//! - **Signing**: Time-stamped HMAC-signed connection URLs (`signing.rs`)
//! - **Protocol**: JSON envelope frames and audio sub-frames (`protocol.rs`)
//! - **Transport**: WebSocket connections via tokio-tungstenite (`transport.rs`)
//!
//! Sessions only see the two traits below, so tests can script an upstream
//! without opening sockets.

use crate::error::SessionError;
use async_trait::async_trait;

pub mod protocol;
pub mod signing;
pub mod transport;

#[cfg(test)]
pub mod mock;

pub use signing::UrlSigners;
pub use transport::WsConnector;

/// One WebSocket message exchanged with the upstream service.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// An open, exclusively owned connection to the upstream service.
///
/// ## Contract:
/// - `recv` must be cancel-safe: sessions poll it inside `tokio::select!`
/// - `recv` returns `None` once the upstream has closed the connection
/// - `close` is idempotent
#[async_trait]
pub trait UpstreamLink: Send {
    async fn send(&mut self, message: UpstreamMessage) -> Result<(), SessionError>;

    async fn recv(&mut self) -> Option<Result<UpstreamMessage, SessionError>>;

    async fn close(&mut self);
}

/// Opens upstream connections from fully signed URLs.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamLink>, SessionError>;
}
