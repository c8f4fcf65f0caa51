//! JSON-RPC 2.0 envelope codec.
//!
//! [`decode`] and [`encode`] are pure functions over byte slices. They hold no
//! state and are safe to call from any number of sessions at once.

use serde_json::{Map, Value};

use crate::protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MethodParams,
    ResponsePayload, RpcId,
};

/// One wire-level message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Envelope {
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String("2.0".into()));
        match self {
            Envelope::Request(req) => {
                obj.insert("id".into(), req.id.to_value());
                obj.insert("method".into(), Value::String(req.method.clone()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Envelope::Notification(n) => {
                obj.insert("method".into(), Value::String(n.method.clone()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Envelope::Response(resp) => {
                obj.insert(
                    "id".into(),
                    resp.id.as_ref().map_or(Value::Null, RpcId::to_value),
                );
                match &resp.payload {
                    ResponsePayload::Result(v) => {
                        obj.insert("result".into(), v.clone());
                    }
                    ResponsePayload::Error(e) => {
                        obj.insert("error".into(), e.to_value());
                    }
                }
            }
        }
        Value::Object(obj)
    }
}

impl From<JsonRpcRequest> for Envelope {
    fn from(r: JsonRpcRequest) -> Self {
        Envelope::Request(r)
    }
}

impl From<JsonRpcResponse> for Envelope {
    fn from(r: JsonRpcResponse) -> Self {
        Envelope::Response(r)
    }
}

impl From<JsonRpcNotification> for Envelope {
    fn from(n: JsonRpcNotification) -> Self {
        Envelope::Notification(n)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {reason}")]
    InvalidRequest { id: Option<RpcId>, reason: String },

    /// A message shaped like a response (an id and no method) that is not a
    /// valid one. It must never be answered.
    #[error("invalid response: {reason}")]
    InvalidResponse { id: Option<RpcId>, reason: String },

    #[error("{reason}")]
    InvalidParams {
        id: Option<RpcId>,
        method: String,
        reason: String,
    },
}

impl DecodeError {
    /// Id of the offending message, when it could be read.
    pub fn id(&self) -> Option<&RpcId> {
        match self {
            DecodeError::Parse(_) => None,
            DecodeError::InvalidRequest { id, .. }
            | DecodeError::InvalidResponse { id, .. }
            | DecodeError::InvalidParams { id, .. } => id.as_ref(),
        }
    }

    /// Whether the sender should get an error response back.
    ///
    /// A notification with bad params has no id and gets none; neither does
    /// a malformed response.
    pub fn wants_reply(&self) -> bool {
        !matches!(
            self,
            DecodeError::InvalidParams { id: None, .. } | DecodeError::InvalidResponse { .. }
        )
    }
}

impl From<&DecodeError> for JsonRpcError {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::Parse(_) => JsonRpcError::parse_error(),
            DecodeError::InvalidRequest { reason, .. } => {
                JsonRpcError::invalid_request_with(format!("Invalid Request: {reason}"))
            }
            DecodeError::InvalidResponse { reason, .. } => {
                JsonRpcError::invalid_request_with(format!("Invalid Response: {reason}"))
            }
            DecodeError::InvalidParams { reason, .. } => JsonRpcError::invalid_params(reason.clone()),
        }
    }
}

/// Serialize an envelope to its wire bytes (no trailing newline).
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.to_value().to_string().into_bytes()
}

/// Parse one frame into an [`Envelope`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|e| DecodeError::Parse(e.to_string()))?;
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| DecodeError::Parse(e.to_string()))?;
    decode_value(value)
}

/// Classify an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        Value::Array(_) => return Err(invalid(None, "batch requests are not supported")),
        _ => return Err(invalid(None, "message must be a JSON object")),
    };

    // Read the id first so later failures can still be answered.
    let raw_id = obj.remove("id");
    let id = match &raw_id {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            RpcId::from_value(v).ok_or_else(|| invalid(None, "id must be a string or integer"))?,
        ),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(invalid(id, "jsonrpc must be \"2.0\""));
    }

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(invalid(id, "method must be a string")),
    };

    match (method, raw_id) {
        (Some(method), Some(raw)) => {
            let Some(id) = id else {
                return Err(invalid(None, format!("request id must not be {raw}")));
            };
            let params = take_params(&mut obj, Some(&id))?;
            check_params(&method, params.as_ref(), Some(&id))?;
            Ok(Envelope::Request(JsonRpcRequest { id, method, params }))
        }
        (Some(method), None) => {
            let params = take_params(&mut obj, None)?;
            check_params(&method, params.as_ref(), None)?;
            Ok(Envelope::Notification(JsonRpcNotification { method, params }))
        }
        (None, Some(_)) => {
            let payload = match (obj.remove("result"), obj.remove("error")) {
                (Some(result), None) => ResponsePayload::Result(result),
                (None, Some(error)) => {
                    let error: JsonRpcError = serde_json::from_value(error).map_err(|e| {
                        invalid_response(id.clone(), format!("malformed error object: {e}"))
                    })?;
                    ResponsePayload::Error(error)
                }
                (Some(_), Some(_)) => {
                    return Err(invalid_response(id, "response carries both result and error"))
                }
                (None, None) => {
                    return Err(invalid_response(id, "response carries neither result nor error"))
                }
            };
            Ok(Envelope::Response(JsonRpcResponse { id, payload }))
        }
        (None, None) => Err(invalid(None, "message has neither id nor method")),
    }
}

fn take_params(obj: &mut Map<String, Value>, id: Option<&RpcId>) -> Result<Option<Value>, DecodeError> {
    match obj.remove("params") {
        None => Ok(None),
        Some(v @ (Value::Object(_) | Value::Array(_))) => Ok(Some(v)),
        Some(_) => Err(invalid(id.cloned(), "params must be an object or array")),
    }
}

fn check_params(method: &str, params: Option<&Value>, id: Option<&RpcId>) -> Result<(), DecodeError> {
    MethodParams::parse(method, params)
        .map(|_| ())
        .map_err(|reason| DecodeError::InvalidParams {
            id: id.cloned(),
            method: method.to_string(),
            reason,
        })
}

fn invalid(id: Option<RpcId>, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidRequest {
        id,
        reason: reason.into(),
    }
}

fn invalid_response(id: Option<RpcId>, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidResponse {
        id,
        reason: reason.into(),
    }
}
