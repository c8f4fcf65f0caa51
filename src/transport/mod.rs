//! Wire transports.
//!
//! Every adapter turns its byte stream into whole frames (one JSON-RPC
//! envelope each) and back. Adapters never look inside a frame.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use url::Url;

pub use http::HttpConnection;
pub use sse::{decode_sse_events, SseConnection, SseDecoder, SseEvent};
pub use stdio::{StdioConnection, MAX_FRAME_BYTES};
pub use websocket::WebSocketConnection;

/// Default connect timeout for HTTP transports (30 seconds).
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("unsupported content-type: {0}")]
    ContentType(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid endpoint configuration: {0}")]
    Endpoint(String),

    /// One frame was over the size limit and skipped. The connection is
    /// still usable.
    #[error("frame of {len} bytes exceeds the size limit")]
    FrameTooLarge { len: usize },

    #[error("connection closed")]
    Closed,
}

/// One bidirectional, frame-oriented connection.
#[async_trait]
pub trait Connection: Send {
    /// Human-readable name used in logs.
    fn label(&self) -> &str;

    /// Send one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Next inbound frame, or `None` once the peer has closed.
    ///
    /// Must be cancel safe: a call dropped inside `tokio::select!` loses no
    /// bytes, and the next call resumes where it stopped.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the underlying handles. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound frames as a lazy stream. Ends at peer close or after the first error.
pub fn frames(
    conn: &mut dyn Connection,
) -> impl Stream<Item = Result<Vec<u8>, TransportError>> + Send + '_ {
    futures::stream::unfold(Some(conn), |state| async move {
        let conn = state?;
        match conn.recv().await {
            Ok(Some(frame)) => Some((Ok(frame), Some(conn))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Transport binding of one downstream server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Http {
        endpoint: Url,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Connection setup limit. Calls are bounded by the request timeouts.
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
    Websocket {
        endpoint: Url,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Sse {
        endpoint: Url,
        /// POST target; when absent it is taken from the stream's `endpoint` event.
        #[serde(default)]
        post_endpoint: Option<Url>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Http { .. } => "http",
            TransportConfig::Websocket { .. } => "websocket",
            TransportConfig::Sse { .. } => "sse",
        }
    }
}

/// Open a connection for `config`, labelled `label` in logs.
pub async fn open(
    label: &str,
    config: &TransportConfig,
) -> Result<Box<dyn Connection>, TransportError> {
    let conn: Box<dyn Connection> = match config {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Box::new(StdioConnection::spawn(
            label,
            command,
            args,
            env,
            cwd.as_deref(),
        )?),
        TransportConfig::Http {
            endpoint,
            headers,
            timeout_ms,
        } => Box::new(HttpConnection::open(
            label,
            endpoint.clone(),
            headers,
            Duration::from_millis(*timeout_ms),
        )?),
        TransportConfig::Websocket { endpoint, headers } => {
            Box::new(WebSocketConnection::open(label, endpoint, headers).await?)
        }
        TransportConfig::Sse {
            endpoint,
            post_endpoint,
            headers,
        } => Box::new(
            SseConnection::open(label, endpoint.clone(), post_endpoint.clone(), headers).await?,
        ),
    };
    tracing::debug!(label, transport = config.kind(), "transport opened");
    Ok(conn)
}

pub(crate) fn header_map(
    headers: &HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Endpoint(format!("header name {name:?}: {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::Endpoint(format!("header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_config_is_tagged_by_type() {
        let cfg: TransportConfig = serde_json::from_value(serde_json::json!({
            "type": "stdio",
            "command": "mcp-server",
            "args": ["--quiet"]
        }))
        .unwrap();
        assert_eq!(cfg.kind(), "stdio");

        let cfg: TransportConfig = serde_json::from_value(serde_json::json!({
            "type": "http",
            "endpoint": "http://localhost:8080/mcp"
        }))
        .unwrap();
        let TransportConfig::Http { timeout_ms, .. } = cfg else {
            panic!("expected http transport");
        };
        assert_eq!(timeout_ms, DEFAULT_HTTP_TIMEOUT_MS);
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            header_map(&headers),
            Err(TransportError::Endpoint(_))
        ));
    }
}
