//! Feed transport
//!
//! [`FeedTransport`] hands the connector successive connections; the
//! WebSocket implementation dials with a fixed retry delay until the
//! endpoint accepts, so a returned error is fatal rather than retryable.
//! Connections deliver text frames only: pings are answered inline and
//! close frames end the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Exchange messages can be large; book snapshots in particular.
const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Source of feed connections.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Produce the next live connection.
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError>;
}

/// One live feed connection.
#[async_trait]
pub trait FeedConnection: Send {
    /// Send one text frame.
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Next inbound text message; `None` when the peer closes cleanly.
    async fn next_message(&mut self) -> Option<Result<String, TransportError>>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
pub struct WsTransport {
    url: String,
    retry_delay: Duration,
}

impl WsTransport {
    pub fn new(url: String, retry_delay: Duration) -> Self {
        Self { url, retry_delay }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_BYTES);
        config.max_frame_size = Some(MAX_MESSAGE_BYTES);

        loop {
            match connect_async_with_config(self.url.as_str(), Some(config), false).await {
                Ok((ws, _response)) => {
                    debug!(url = %self.url, "websocket connected");
                    return Ok(Box::new(WsConnection { ws }));
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "connect failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = self.ws.send(Message::Pong(payload)).await {
                        return Some(Err(err.into()));
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
