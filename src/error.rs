use std::time::Duration;

use serde_json::{json, Value};

use crate::bridge::BridgeError;
use crate::codec::DecodeError;
use crate::config::ConfigError;
use crate::correlation::CorrelationError;
use crate::negotiator::HandshakeError;
use crate::protocol::{JsonRpcError, McpErrorCode};
use crate::router::RoutingError;
use crate::schema::SchemaValidationError;
use crate::transport::TransportError;

/// Seconds a client is told to wait after `ServerBusy`.
const BUSY_RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaValidationError),

    #[error("request timed out: {method}")]
    Timeout {
        method: String,
        retry_after: Option<Duration>,
    },

    #[error("no downstream server completed its handshake")]
    NoDownstreamAvailable,

    #[error("session is closing")]
    SessionClosing,

    #[error("downstream '{server}' is busy")]
    ServerBusy { server: String },

    #[error("downstream '{server}' is unavailable")]
    DownstreamUnavailable { server: String },
}

impl From<&ProxyError> for JsonRpcError {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::Decode(e) => e.into(),
            ProxyError::Correlation(CorrelationError::DuplicateRequestId(_)) => {
                JsonRpcError::invalid_request_with(err.to_string())
            }
            ProxyError::Correlation(CorrelationError::Orphan { .. }) => {
                JsonRpcError::internal_error(err.to_string())
            }
            ProxyError::Handshake(_) | ProxyError::Transport(_) => {
                JsonRpcError::new(McpErrorCode::DownstreamUnavailable, err.to_string())
            }
            ProxyError::Routing(RoutingError::NoCapableServer(key)) => {
                JsonRpcError::new(McpErrorCode::NoCapableServer, err.to_string())
                    .with_data(json!({ "kind": key.kind().result_field(), "name": key.name() }))
            }
            ProxyError::Bridge(e) => e.into(),
            ProxyError::Config(_) => JsonRpcError::internal_error(err.to_string()),
            ProxyError::Schema(SchemaValidationError::ValidationFailed(errors)) => {
                JsonRpcError::invalid_params(format!("Invalid arguments: {}", errors.join("; ")))
                    .with_data(json!({ "errors": errors }))
            }
            ProxyError::Schema(_) => JsonRpcError::internal_error(err.to_string()),
            ProxyError::Timeout {
                method,
                retry_after,
            } => JsonRpcError::timeout(method, *retry_after),
            ProxyError::NoDownstreamAvailable => {
                JsonRpcError::new(McpErrorCode::DownstreamUnavailable, err.to_string())
            }
            ProxyError::SessionClosing => {
                JsonRpcError::new(McpErrorCode::SessionClosing, "Session is closing")
            }
            ProxyError::ServerBusy { server } => {
                JsonRpcError::new(McpErrorCode::ServerBusy, err.to_string())
                    .with_data(json!({ "server": server, "retry_after": BUSY_RETRY_AFTER_SECS }))
            }
            ProxyError::DownstreamUnavailable { server } => {
                JsonRpcError::new(McpErrorCode::DownstreamUnavailable, err.to_string())
                    .with_data(json!({ "server": server }))
            }
        }
    }
}

/// Keep a downstream error inside the code ranges promised upstream.
///
/// Codes outside them become `-32000`; the original code and the server's
/// name are added to `data` (merged into an existing object, otherwise the
/// old `data` is kept under `"data"`).
pub fn normalize_downstream_error(err: JsonRpcError, server: &str) -> JsonRpcError {
    if err.is_standard_code() {
        return err;
    }
    let mut data = serde_json::Map::new();
    match err.data {
        Some(Value::Object(obj)) => data.extend(obj),
        Some(other) => {
            data.insert("data".into(), other);
        }
        None => {}
    }
    data.insert("original_code".into(), err.code.into());
    data.insert("server".into(), Value::String(server.to_string()));
    JsonRpcError {
        code: McpErrorCode::ServerError.code(),
        message: err.message,
        data: Some(Value::Object(data)),
    }
}
