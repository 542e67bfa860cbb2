//! WebSocket transport to the upstream speech cloud.
//!
//! Connect timeouts are applied by the sessions (they own the deadline), so this
//! layer only maps tungstenite's messages and errors onto `UpstreamMessage` /
//! `SessionError`.

use super::{UpstreamConnector, UpstreamLink, UpstreamMessage};
use crate::error::SessionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// How long a closing handshake may take before the socket is just dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamLink>, SessionError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SessionError::UpstreamConnect(e.to_string()))?;

        debug!(status = %response.status(), "upstream websocket established");

        Ok(Box::new(WsLink { stream, closed: false }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl UpstreamLink for WsLink {
    async fn send(&mut self, message: UpstreamMessage) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::UpstreamTransport("connection already closed".to_string()));
        }

        let message = match message {
            UpstreamMessage::Text(text) => Message::Text(text),
            UpstreamMessage::Binary(bytes) => Message::Binary(bytes),
        };

        self.stream
            .send(message)
            .await
            .map_err(|e| SessionError::UpstreamTransport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<UpstreamMessage, SessionError>> {
        if self.closed {
            return None;
        }

        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(UpstreamMessage::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(UpstreamMessage::Binary(bytes))),
                // tungstenite queues the pong reply itself while reading.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "upstream sent close frame");
                    return None;
                }
                Err(e) => return Some(Err(SessionError::UpstreamTransport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.close(None)).await {
            Ok(Ok(())) => {}
            // Already-closed peers are the common case here.
            Ok(Err(e)) => warn!("upstream close failed: {}", e),
            Err(_) => warn!("upstream did not acknowledge close within {}s", CLOSE_TIMEOUT.as_secs()),
        }
    }
}
