//! Typed per-method parameters.
//!
//! Raw `params` values are parsed into a [`MethodParams`] variant at the
//! boundary so the core never routes on untyped JSON. Methods the proxy does
//! not know are carried through as [`MethodParams::Other`].

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::capabilities::ListKind;
use super::request::{
    CancelledParams, CompleteParams, GetPromptParams, InitializeParams, PaginatedParams,
    ResourceParams, ToolCallParams,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MethodParams {
    Initialize(InitializeParams),
    CallTool(ToolCallParams),
    ReadResource(ResourceParams),
    Subscribe(ResourceParams),
    Unsubscribe(ResourceParams),
    GetPrompt(GetPromptParams),
    List(ListKind, PaginatedParams),
    Complete(CompleteParams),
    Cancelled(CancelledParams),
    Ping,
    Other(Option<Value>),
}

impl MethodParams {
    /// Parse `params` according to the declared shape of `method`.
    ///
    /// Returns a human-readable reason on failure; the codec wraps it into an
    /// `InvalidParams` error.
    pub fn parse(method: &str, params: Option<&Value>) -> Result<Self, String> {
        Ok(match method {
            "initialize" => Self::Initialize(required(method, params)?),
            "tools/call" => Self::CallTool(required(method, params)?),
            "resources/read" => Self::ReadResource(required(method, params)?),
            "resources/subscribe" => Self::Subscribe(required(method, params)?),
            "resources/unsubscribe" => Self::Unsubscribe(required(method, params)?),
            "prompts/get" => Self::GetPrompt(required(method, params)?),
            "completion/complete" => Self::Complete(required(method, params)?),
            "notifications/cancelled" => Self::Cancelled(required(method, params)?),
            "tools/list" => Self::List(ListKind::Tools, optional(method, params)?),
            "resources/list" => Self::List(ListKind::Resources, optional(method, params)?),
            "prompts/list" => Self::List(ListKind::Prompts, optional(method, params)?),
            "ping" => Self::Ping,
            _ => Self::Other(params.cloned()),
        })
    }
}

fn required<T: DeserializeOwned>(method: &str, params: Option<&Value>) -> Result<T, String> {
    match params {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("Invalid {method} params: {e}")),
        None => Err(format!("Missing params for {method}")),
    }
}

fn optional<T: DeserializeOwned + Default>(
    method: &str,
    params: Option<&Value>,
) -> Result<T, String> {
    match params {
        Some(Value::Null) | None => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("Invalid {method} params: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::CompletionRef;

    #[test]
    fn tools_call_requires_name() {
        let err = MethodParams::parse("tools/call", Some(&json!({"arguments": {}}))).unwrap_err();
        assert!(err.contains("tools/call"), "{err}");

        let ok = MethodParams::parse("tools/call", Some(&json!({"name": "search"}))).unwrap();
        assert_eq!(
            ok,
            MethodParams::CallTool(ToolCallParams {
                name: "search".into(),
                arguments: None
            })
        );
    }

    #[test]
    fn list_params_are_optional() {
        assert_eq!(
            MethodParams::parse("tools/list", None).unwrap(),
            MethodParams::List(ListKind::Tools, PaginatedParams::default())
        );
        assert_eq!(
            MethodParams::parse("prompts/list", Some(&json!({"cursor": "10"}))).unwrap(),
            MethodParams::List(
                ListKind::Prompts,
                PaginatedParams {
                    cursor: Some("10".into())
                }
            )
        );
    }

    #[test]
    fn completion_ref_is_tagged() {
        let parsed = MethodParams::parse(
            "completion/complete",
            Some(&json!({
                "ref": {"type": "ref/resource", "uri": "file:///a"},
                "argument": {"name": "x", "value": "y"}
            })),
        )
        .unwrap();
        let MethodParams::Complete(p) = parsed else {
            panic!("expected completion params");
        };
        assert_eq!(
            p.reference,
            CompletionRef::Resource {
                uri: "file:///a".into()
            }
        );
    }

    #[test]
    fn unknown_methods_pass_through() {
        let params = json!({"level": "debug"});
        assert_eq!(
            MethodParams::parse("logging/setLevel", Some(&params)).unwrap(),
            MethodParams::Other(Some(params))
        );
    }
}
