use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Connection, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_err(e: tungstenite::Error) -> TransportError {
    TransportError::WebSocket(Box::new(e))
}

/// Full-duplex WebSocket: one text message per envelope.
pub struct WebSocketConnection {
    label: String,
    ws: WsStream,
    closed: bool,
}

impl WebSocketConnection {
    pub async fn open(
        label: &str,
        endpoint: &Url,
        headers: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut request = endpoint.as_str().into_client_request().map_err(ws_err)?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Endpoint(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Endpoint(format!("header value for {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(ws_err)?;
        tracing::debug!(label, status = %response.status(), "websocket connected");

        Ok(Self {
            label: label.to_string(),
            ws,
            closed: false,
        })
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let msg = match std::str::from_utf8(frame) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(frame.to_vec()),
        };
        self.ws.send(msg).await.map_err(ws_err)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        while !self.closed {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(label = %self.label, ?frame, "websocket closed by peer");
                    self.closed = true;
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ws_err(e)),
                None => self.closed = true,
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_err(e)),
        }
    }
}
