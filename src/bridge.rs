//! Tool calls served by A2A agents.
//!
//! A `tools/call` routed to an agent becomes a [`TaskRequest`] wrapped in an
//! [`A2ARequest`] and POSTed to the agent's endpoint. The reply is checked
//! against the request and turned back into an MCP tool result.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::protocol::a2a::{
    A2AError, A2ARequest, A2AResponse, AuthenticationToken, RequestContext, TaskContext,
    TaskPriority, TaskRequest, TaskRequirements, TaskType, TokenType,
};
use crate::protocol::{CallToolResult, Content, JsonRpcError, McpErrorCode, ToolCallParams};
use crate::router::select_agent;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned HTTP {status}")]
    Status { status: u16 },

    #[error("malformed agent reply: {0}")]
    Malformed(String),

    #[error("agent reply id {got} does not match request {expected}")]
    IdMismatch { expected: String, got: String },

    #[error("reply from unexpected agent '{got}', expected '{expected}'")]
    WrongSender { expected: String, got: String },

    #[error("agent '{0}' does not satisfy the task requirements")]
    Ineligible(String),

    #[error("agent error {}: {}", .0.code, .0.message)]
    Agent(A2AError),
}

impl From<&BridgeError> for JsonRpcError {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Agent(e) => a2a_error_to_rpc(e),
            BridgeError::Http(e) if e.is_timeout() => JsonRpcError::timeout("tools/call", None),
            BridgeError::Http(e) => {
                JsonRpcError::new(McpErrorCode::DownstreamUnavailable, e.to_string())
            }
            BridgeError::Ineligible(_) => {
                JsonRpcError::new(McpErrorCode::NoCapableServer, err.to_string())
            }
            BridgeError::Status { status } => {
                JsonRpcError::new(McpErrorCode::ServerError, err.to_string())
                    .with_data(json!({ "status": status }))
            }
            BridgeError::Malformed(_)
            | BridgeError::IdMismatch { .. }
            | BridgeError::WrongSender { .. } => {
                JsonRpcError::new(McpErrorCode::ServerError, err.to_string())
            }
        }
    }
}

/// Map an A2A error onto the upstream code vocabulary.
///
/// The agent's own code, details, retry hint and recovery suggestions travel
/// in `data`.
pub fn a2a_error_to_rpc(err: &A2AError) -> JsonRpcError {
    let code = match err.code.as_str() {
        "TIMEOUT" => McpErrorCode::RequestTimeout,
        "VALIDATION" | "VALIDATION_ERROR" => McpErrorCode::InvalidParams,
        "NOT_FOUND" => McpErrorCode::MethodNotFound,
        "RESOURCE_LIMIT" | "RATE_LIMITED" => McpErrorCode::ServerBusy,
        _ => McpErrorCode::ServerError,
    };

    let mut data = Map::new();
    data.insert("a2a_code".into(), Value::String(err.code.clone()));
    if let Some(details) = &err.details {
        data.insert("details".into(), details.clone());
    }
    if let Some(secs) = err.retry_after {
        data.insert("retry_after".into(), secs.into());
    }
    if let Some(suggestions) = &err.recovery_suggestions {
        data.insert("recovery_suggestions".into(), json!(suggestions));
    }
    JsonRpcError::new(code, err.message.clone()).with_data(Value::Object(data))
}

/// Turn an agent result into tool content.
///
/// A result that already looks like a tool result (or a bare content array)
/// passes through. Anything else is rendered as JSON text.
pub fn result_to_tool_result(result: Value) -> CallToolResult {
    if result.get("content").is_some_and(Value::is_array) {
        if let Ok(parsed) = serde_json::from_value::<CallToolResult>(result.clone()) {
            return parsed;
        }
    }
    if result.is_array() {
        if let Ok(content) = serde_json::from_value::<Vec<Content>>(result.clone()) {
            return CallToolResult {
                content,
                is_error: false,
            };
        }
    }
    match result {
        Value::String(text) => CallToolResult::text(text),
        other => CallToolResult::text(other.to_string()),
    }
}

/// Check an agent reply against the request it answers.
pub fn interpret_response(
    request: &A2ARequest,
    response: A2AResponse,
) -> Result<CallToolResult, BridgeError> {
    if response.id != request.id {
        return Err(BridgeError::IdMismatch {
            expected: request.id.clone(),
            got: response.id,
        });
    }
    if response.from != request.to {
        return Err(BridgeError::WrongSender {
            expected: request.to.clone(),
            got: response.from,
        });
    }
    if let Some(err) = response.error {
        return Err(BridgeError::Agent(err));
    }
    Ok(result_to_tool_result(response.result.unwrap_or(Value::Null)))
}

#[derive(Debug, Clone)]
pub struct AgentBridge {
    http: reqwest::Client,
    proxy_id: String,
    min_trust_score: Option<f64>,
}

impl AgentBridge {
    pub fn new(proxy_id: impl Into<String>, min_trust_score: Option<f64>) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            proxy_id: proxy_id.into(),
            min_trust_score,
        })
    }

    /// The unit of work an agent is asked to perform for one tool call.
    pub fn task_for(&self, call: &ToolCallParams, session_id: &str, timeout: Duration) -> TaskRequest {
        TaskRequest {
            id: Uuid::new_v4().to_string(),
            task_type: TaskType::Execution,
            priority: TaskPriority::Medium,
            requirements: TaskRequirements {
                capabilities: vec![call.name.clone()],
                minimum_trust_score: self.min_trust_score,
                geographic_preferences: None,
            },
            context: TaskContext {
                conversation_id: Some(session_id.to_string()),
                ..Default::default()
            },
            deadline: chrono::Duration::from_std(timeout)
                .ok()
                .map(|d| Utc::now() + d),
        }
    }

    pub fn build_request(
        &self,
        agent: &AgentConfig,
        task: &TaskRequest,
        call: &ToolCallParams,
        timeout: Duration,
    ) -> A2ARequest {
        let authentication = agent.auth_token.as_ref().map(|token| AuthenticationToken {
            token_type: TokenType::Bearer,
            value: token.clone(),
            expiry: None,
            scopes: Vec::new(),
        });
        A2ARequest {
            id: task.id.clone(),
            from: self.proxy_id.clone(),
            to: agent.card.id.clone(),
            method: call.name.clone(),
            params: call.arguments.clone().unwrap_or_else(|| json!({})),
            context: RequestContext {
                authentication,
                correlation_id: task.id.clone(),
                trace_id: task.context.conversation_id.clone(),
                security_context: None,
                timestamp: Utc::now(),
            },
            timeout: Some(timeout.as_millis() as u64),
        }
    }

    /// Run one tool call on `agent`.
    pub async fn call_tool(
        &self,
        agent: &AgentConfig,
        call: &ToolCallParams,
        session_id: &str,
        timeout: Duration,
    ) -> Result<CallToolResult, BridgeError> {
        let task = self.task_for(call, session_id, timeout);
        if select_agent(&task, std::slice::from_ref(&agent.card)).is_none() {
            return Err(BridgeError::Ineligible(agent.card.id.clone()));
        }
        let request = self.build_request(agent, &task, call, timeout);
        tracing::debug!(agent = %agent.card.id, tool = %call.name, request_id = %request.id, "dispatching to agent");

        let mut req = self
            .http
            .post(agent.endpoint.clone())
            .timeout(timeout)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(token) = &agent.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        let parsed = serde_json::from_slice::<A2AResponse>(&body);
        match parsed {
            Ok(reply) => interpret_response(&request, reply),
            Err(_) if !status.is_success() => Err(BridgeError::Status {
                status: status.as_u16(),
            }),
            Err(e) => Err(BridgeError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::a2a::ResponseContext;

    fn agent() -> AgentConfig {
        serde_json::from_value(json!({
            "endpoint": "http://127.0.0.1:9/a2a",
            "auth_token": "secret",
            "card": {
                "id": "researcher",
                "name": "Researcher",
                "capabilities": {"tools": [{"name": "search"}]},
                "metadata": {"version": "1", "trust_score": 0.8, "last_updated": "2025-01-01T00:00:00Z"}
            }
        }))
        .unwrap()
    }

    fn reply(request: &A2ARequest, result: Option<Value>, error: Option<A2AError>) -> A2AResponse {
        A2AResponse {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            result,
            error,
            context: ResponseContext {
                correlation_id: request.context.correlation_id.clone(),
                trace_id: None,
                processing_time: 12,
                agent_metadata: None,
                timestamp: Utc::now(),
            },
        }
    }

    fn call() -> ToolCallParams {
        ToolCallParams {
            name: "search".into(),
            arguments: Some(json!({"q": "rust"})),
        }
    }

    #[test]
    fn request_carries_identity_and_auth() {
        let bridge = AgentBridge::new("proxy-1", None).unwrap();
        let agent = agent();
        let task = bridge.task_for(&call(), "session-9", Duration::from_secs(5));
        let req = bridge.build_request(&agent, &task, &call(), Duration::from_secs(5));

        assert_eq!(req.from, "proxy-1");
        assert_eq!(req.to, "researcher");
        assert_eq!(req.method, "search");
        assert_eq!(req.params, json!({"q": "rust"}));
        assert_eq!(req.timeout, Some(5_000));
        assert_eq!(req.context.trace_id.as_deref(), Some("session-9"));
        let auth = req.context.authentication.unwrap();
        assert_eq!(auth.token_type, TokenType::Bearer);
        assert_eq!(auth.value, "secret");
        assert_eq!(task.requirements.capabilities, vec!["search".to_string()]);
    }

    #[test]
    fn reply_must_match_request() {
        let bridge = AgentBridge::new("proxy-1", None).unwrap();
        let task = bridge.task_for(&call(), "s", Duration::from_secs(1));
        let req = bridge.build_request(&agent(), &task, &call(), Duration::from_secs(1));

        let mut wrong_id = reply(&req, Some(json!("ok")), None);
        wrong_id.id = "other".into();
        assert!(matches!(
            interpret_response(&req, wrong_id),
            Err(BridgeError::IdMismatch { .. })
        ));

        let mut wrong_sender = reply(&req, Some(json!("ok")), None);
        wrong_sender.from = "impostor".into();
        assert!(matches!(
            interpret_response(&req, wrong_sender),
            Err(BridgeError::WrongSender { .. })
        ));

        let ok = interpret_response(&req, reply(&req, Some(json!({"hits": 3})), None)).unwrap();
        assert_eq!(ok.content, vec![Content::Text { text: "{\"hits\":3}".into() }]);
    }

    #[test]
    fn tool_shaped_results_pass_through() {
        let result = result_to_tool_result(json!({
            "content": [{"type": "text", "text": "done"}],
            "isError": false
        }));
        assert_eq!(result.content, vec![Content::Text { text: "done".into() }]);

        let result = result_to_tool_result(json!([{"type": "text", "text": "a"}]));
        assert_eq!(result.content.len(), 1);

        let result = result_to_tool_result(json!("plain"));
        assert_eq!(result.content, vec![Content::Text { text: "plain".into() }]);
    }

    #[test]
    fn a2a_errors_map_to_rpc_codes() {
        let err = |code: &str| A2AError {
            code: code.into(),
            message: "failed".into(),
            details: Some(json!({"field": "q"})),
            retry_after: Some(30),
            recovery_suggestions: Some(vec!["wait".into()]),
        };

        let rpc = a2a_error_to_rpc(&err("TIMEOUT"));
        assert_eq!(rpc.code, -32002);
        let data = rpc.data.unwrap();
        assert_eq!(data["retry_after"], 30);
        assert_eq!(data["details"]["field"], "q");
        assert_eq!(data["recovery_suggestions"], json!(["wait"]));

        assert_eq!(a2a_error_to_rpc(&err("VALIDATION")).code, -32602);
        assert_eq!(a2a_error_to_rpc(&err("NOT_FOUND")).code, -32601);
        assert_eq!(a2a_error_to_rpc(&err("RATE_LIMITED")).code, -32005);
        assert_eq!(a2a_error_to_rpc(&err("RESOURCE_LIMIT")).code, -32005);
        assert_eq!(a2a_error_to_rpc(&err("EXPLODED")).code, -32000);

        let bridged = JsonRpcError::from(&BridgeError::Agent(err("NOT_FOUND")));
        assert_eq!(bridged.code, -32601);
    }
}
