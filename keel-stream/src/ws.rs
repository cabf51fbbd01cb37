//! WebSocket transport built on tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{StreamConnector, StreamError, StreamResult, StreamTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials a fixed WebSocket endpoint.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> StreamResult<Box<dyn StreamTransport>> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        debug!(url = %self.url, "websocket established");
        Ok(Box::new(WsTransport { socket }))
    }
}

struct WsTransport {
    socket: WsStream,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&mut self, frame: String) -> StreamResult<()> {
        self.socket
            .send(Message::Text(frame))
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Option<StreamResult<String>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("received non UTF-8 binary payload"),
                },
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        return Some(Err(StreamError::Transport(err.to_string())));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Err(err) => return Some(Err(StreamError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}
