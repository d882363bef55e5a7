//! Socket abstraction.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! channel task owns the transport for as long as the connection lives.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::RealtimeError;

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), RealtimeError>;

    /// Next text message. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, RealtimeError>>;

    async fn close(&mut self) -> Result<(), RealtimeError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, RealtimeError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, RealtimeError> {
        let (ws, _response) = connect_async(url.as_str()).await?;
        Ok(Box::new(WebSocketTransport { ws }))
    }
}

struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), RealtimeError> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, RealtimeError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Server closed the socket");
                    return None;
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), RealtimeError> {
        self.ws.close(None).await?;
        Ok(())
    }
}
