use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::request::RpcId;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 response layer
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 response envelope.
///
/// `id` is `None` only for errors answering a message whose id could not be
/// read (serialized as `"id": null`).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Option<RpcId>,
    pub payload: ResponsePayload,
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(serde_json::Value),
    Error(JsonRpcError),
}

impl JsonRpcResponse {
    pub fn success(id: Option<RpcId>, result: serde_json::Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: Option<RpcId>, error: JsonRpcError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(e) => Some(e),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: McpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(McpErrorCode::ParseError, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(McpErrorCode::InvalidRequest, "Invalid Request")
    }

    pub fn invalid_request_with(detail: impl Into<String>) -> Self {
        Self::new(McpErrorCode::InvalidRequest, detail)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            McpErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(McpErrorCode::InvalidParams, detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(McpErrorCode::InternalError, detail)
    }

    /// Synthetic timeout error. `retry_after` is reported in whole seconds.
    pub fn timeout(method: &str, retry_after: Option<Duration>) -> Self {
        let err = Self::new(
            McpErrorCode::RequestTimeout,
            format!("Request timed out: {method}"),
        );
        match retry_after {
            Some(d) => err.with_data(serde_json::json!({ "retry_after": d.as_secs().max(1) })),
            None => err,
        }
    }

    /// Build the wire object without going through serde (cannot fail).
    pub fn to_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("code".into(), self.code.into());
        obj.insert("message".into(), self.message.clone().into());
        if let Some(data) = &self.data {
            obj.insert("data".into(), data.clone());
        }
        serde_json::Value::Object(obj)
    }

    /// Whether the code lies inside one of the two ranges upstream clients
    /// are promised: protocol-level `-32700..=-32600` or server-defined
    /// `-32099..=-32000`.
    pub fn is_standard_code(&self) -> bool {
        (-32700..=-32600).contains(&self.code) || (-32099..=-32000).contains(&self.code)
    }
}

// ---------------------------------------------------------------------------
// Error code vocabulary exposed upstream
// ---------------------------------------------------------------------------

/// Numeric error codes used on the upstream boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// Generic downstream failure (`-32000`).
    ServerError,
    NoCapableServer,
    RequestTimeout,
    DownstreamUnavailable,
    SessionClosing,
    ServerBusy,
}

impl McpErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::NoCapableServer => -32001,
            Self::RequestTimeout => -32002,
            Self::DownstreamUnavailable => -32003,
            Self::SessionClosing => -32004,
            Self::ServerBusy => -32005,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ServerError,
            -32001 => Self::NoCapableServer,
            -32002 => Self::RequestTimeout,
            -32003 => Self::DownstreamUnavailable,
            -32004 => Self::SessionClosing,
            -32005 => Self::ServerBusy,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// MCP tool result layer (returned inside a *successful* JSON-RPC response)
// ---------------------------------------------------------------------------

/// MCP `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// A single content block inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceReference,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub uri: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: true,
        }
    }
}
