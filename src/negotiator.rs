//! Downstream handshakes and the merged capability view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::{self, Envelope};
use crate::config::{ProtocolConfig, RetryPolicy};
use crate::protocol::a2a::AgentCard;
use crate::protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListKind, McpCapabilities, Prompt, PromptsCapability,
    Resource, ResourcesCapability, ResponsePayload, RpcId, Tool, ToolsCapability,
};
use crate::protocol::capabilities::{RootsCapability, SamplingCapability};
use crate::registry::ServerId;
use crate::transport::{Connection, TransportError};

/// Upper bound on `nextCursor` pages followed per listing.
pub const MAX_LIST_PAGES: usize = 32;

/// Protocol label recorded for A2A agents, which never run `initialize`.
const A2A_PROTOCOL: &str = "a2a";

/// What one downstream declared during its handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCapabilities {
    pub server_id: ServerId,
    pub server_name: String,
    pub server_info: Implementation,
    pub protocol_version: String,
    pub capabilities: McpCapabilities,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    /// Set for A2A agents only.
    pub trust_score: Option<f64>,
}

impl ServerCapabilities {
    /// Capability record of an A2A agent, built from its card.
    pub fn from_agent_card(server_id: ServerId, card: &AgentCard) -> Self {
        let tools = card
            .capabilities
            .tools
            .iter()
            .map(|t| Tool {
                name: t.name.clone(),
                description: (!t.description.is_empty()).then(|| t.description.clone()),
                input_schema: t.parameters.clone(),
            })
            .collect();
        Self {
            server_id,
            server_name: card.id.clone(),
            server_info: Implementation {
                name: card.name.clone(),
                version: card.metadata.version.clone(),
            },
            protocol_version: A2A_PROTOCOL.to_string(),
            capabilities: McpCapabilities {
                tools: Some(ToolsCapability::default()),
                ..Default::default()
            },
            tools,
            resources: Vec::new(),
            prompts: Vec::new(),
            trust_score: Some(card.metadata.trust_score),
        }
    }

    pub fn is_agent(&self) -> bool {
        self.trust_score.is_some()
    }

    /// Replace one category wholesale with freshly listed entries.
    pub fn replace_entries(&mut self, kind: ListKind, entries: Vec<Value>) {
        match kind {
            ListKind::Tools => self.tools = parse_entries(&self.server_name, kind, entries),
            ListKind::Resources => self.resources = parse_entries(&self.server_name, kind, entries),
            ListKind::Prompts => self.prompts = parse_entries(&self.server_name, kind, entries),
        }
    }

    fn advertises(&self, kind: ListKind) -> bool {
        match kind {
            ListKind::Tools => self.capabilities.tools.is_some(),
            ListKind::Resources => self.capabilities.resources.is_some(),
            ListKind::Prompts => self.capabilities.prompts.is_some(),
        }
    }
}

fn parse_entries<T: DeserializeOwned>(server: &str, kind: ListKind, entries: Vec<Value>) -> Vec<T> {
    entries
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(server, list = kind.list_method(), error = %e, "skipping malformed entry");
                None
            }
        })
        .collect()
}

/// One entry of the merged view with the downstream that serves it.
#[derive(Debug, Clone, PartialEq)]
pub struct Provided<T> {
    pub item: T,
    pub server: ServerId,
}

/// A name claimed by more than one downstream. `winner` registered first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowedEntry {
    pub kind: ListKind,
    pub name: String,
    pub winner: ServerId,
    pub shadowed: ServerId,
}

/// Merged capabilities of every available downstream.
///
/// Built from scratch on every change and shared as an immutable snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedCapabilities {
    pub tools: Vec<Provided<Tool>>,
    pub resources: Vec<Provided<Resource>>,
    pub prompts: Vec<Provided<Prompt>>,
    pub shadowed: Vec<ShadowedEntry>,
    providers: HashMap<(ListKind, String), Vec<ServerId>>,
    servers: Vec<Arc<ServerCapabilities>>,
}

impl AggregatedCapabilities {
    /// Merge `servers`. On a name collision the lowest `ServerId` (first
    /// registered) wins regardless of input order.
    pub fn build(servers: &[Arc<ServerCapabilities>]) -> Self {
        let mut ordered = servers.to_vec();
        ordered.sort_by_key(|s| s.server_id);

        let mut agg = AggregatedCapabilities::default();
        for server in &ordered {
            let id = server.server_id;
            for tool in &server.tools {
                if agg.claim(ListKind::Tools, &tool.name, id) {
                    agg.tools.push(Provided {
                        item: tool.clone(),
                        server: id,
                    });
                }
            }
            for resource in &server.resources {
                if agg.claim(ListKind::Resources, &resource.uri, id) {
                    agg.resources.push(Provided {
                        item: resource.clone(),
                        server: id,
                    });
                }
            }
            for prompt in &server.prompts {
                if agg.claim(ListKind::Prompts, &prompt.name, id) {
                    agg.prompts.push(Provided {
                        item: prompt.clone(),
                        server: id,
                    });
                }
            }
        }
        agg.servers = ordered;
        agg
    }

    /// Record `server` as a provider of `name`. Returns true if it is the first.
    fn claim(&mut self, kind: ListKind, name: &str, server: ServerId) -> bool {
        let providers = self.providers.entry((kind, name.to_string())).or_default();
        if providers.contains(&server) {
            return false;
        }
        providers.push(server);
        if providers.len() == 1 {
            return true;
        }
        self.shadowed.push(ShadowedEntry {
            kind,
            name: name.to_string(),
            winner: providers[0],
            shadowed: server,
        });
        false
    }

    /// Every downstream that declared `name`, in registration order.
    pub fn providers(&self, kind: ListKind, name: &str) -> &[ServerId] {
        self.providers
            .get(&(kind, name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerCapabilities> {
        self.servers
            .iter()
            .find(|s| s.server_id == id)
            .map(Arc::as_ref)
    }

    pub fn trust_score(&self, id: ServerId) -> Option<f64> {
        self.server(id).and_then(|s| s.trust_score)
    }

    /// `inputSchema` of `tool` as declared by `server`.
    pub fn tool_schema(&self, server: ServerId, tool: &str) -> Option<&Value> {
        self.server(server)?
            .tools
            .iter()
            .find(|t| t.name == tool)
            .map(|t| &t.input_schema)
    }

    /// Winning entries of one category as JSON, in merge order.
    pub fn list(&self, kind: ListKind) -> Vec<Value> {
        fn to_values<T: serde::Serialize>(items: &[Provided<T>]) -> Vec<Value> {
            items
                .iter()
                .filter_map(|p| serde_json::to_value(&p.item).ok())
                .collect()
        }
        match kind {
            ListKind::Tools => to_values(&self.tools),
            ListKind::Resources => to_values(&self.resources),
            ListKind::Prompts => to_values(&self.prompts),
        }
    }

    /// Capability flags the proxy advertises upstream.
    ///
    /// `listChanged` is always set because downstream changes are relayed.
    pub fn mcp_capabilities(&self) -> McpCapabilities {
        let any = |kind: ListKind| self.servers.iter().any(|s| s.advertises(kind));
        let subscribe = self.servers.iter().any(|s| {
            s.capabilities
                .resources
                .as_ref()
                .and_then(|r| r.subscribe)
                .unwrap_or(false)
        });
        McpCapabilities {
            tools: any(ListKind::Tools).then(|| ToolsCapability {
                list_changed: Some(true),
            }),
            resources: any(ListKind::Resources).then(|| ResourcesCapability {
                subscribe: subscribe.then_some(true),
                list_changed: Some(true),
            }),
            prompts: any(ListKind::Prompts).then(|| PromptsCapability {
                list_changed: Some(true),
            }),
            roots: None,
            sampling: None,
        }
    }

    /// Categories where `server` contributes at least one entry.
    pub fn kinds_served_by(&self, server: ServerId) -> Vec<ListKind> {
        let mut kinds = Vec::new();
        if self.tools.iter().any(|p| p.server == server) {
            kinds.push(ListKind::Tools);
        }
        if self.resources.iter().any(|p| p.server == server) {
            kinds.push(ListKind::Resources);
        }
        if self.prompts.iter().any(|p| p.server == server) {
            kinds.push(ListKind::Prompts);
        }
        kinds
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("incompatible protocol version: requested {requested}, server offered {offered}")]
    IncompatibleProtocolVersion { requested: String, offered: String },

    #[error("initialize rejected ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("malformed initialize result: {0}")]
    MalformedResult(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HandshakeError::Timeout(_) | HandshakeError::IncompatibleProtocolVersion { .. }
        )
    }
}

pub struct Negotiator {
    protocol: ProtocolConfig,
    client_info: Implementation,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Negotiator {
    pub fn new(protocol: ProtocolConfig, client_info: Implementation, timeout: Duration) -> Self {
        Self {
            protocol,
            client_info,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> RpcId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        RpcId::Str(format!("proxy-handshake-{n}"))
    }

    /// Run `initialize` against `conn` and list what the server offers.
    pub async fn handshake(
        &self,
        server_id: ServerId,
        name: &str,
        conn: &mut dyn Connection,
    ) -> Result<ServerCapabilities, HandshakeError> {
        let params = InitializeParams {
            protocol_version: self.protocol.version.clone(),
            capabilities: McpCapabilities {
                roots: Some(RootsCapability {
                    list_changed: Some(true),
                }),
                sampling: Some(SamplingCapability {}),
                ..Default::default()
            },
            client_info: self.client_info.clone(),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| HandshakeError::MalformedResult(e.to_string()))?;

        let result = self.call(conn, "initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| HandshakeError::MalformedResult(e.to_string()))?;

        if !self.protocol.accepts(&init.protocol_version) {
            return Err(HandshakeError::IncompatibleProtocolVersion {
                requested: self.protocol.version.clone(),
                offered: init.protocol_version,
            });
        }

        let initialized = JsonRpcNotification::new("notifications/initialized", None);
        conn.send(&codec::encode(&initialized.into())).await?;

        let mut caps = ServerCapabilities {
            server_id,
            server_name: name.to_string(),
            server_info: init.server_info,
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            trust_score: None,
        };
        for kind in ListKind::ALL {
            if caps.advertises(kind) {
                let entries = self.list_all(conn, name, kind).await?;
                caps.replace_entries(kind, entries);
            }
        }

        tracing::info!(
            server = name,
            protocol = %caps.protocol_version,
            tools = caps.tools.len(),
            resources = caps.resources.len(),
            prompts = caps.prompts.len(),
            "handshake complete"
        );
        Ok(caps)
    }

    /// [`Negotiator::handshake`] with exponential backoff on retriable failures.
    pub async fn handshake_with_retry(
        &self,
        server_id: ServerId,
        name: &str,
        conn: &mut dyn Connection,
        policy: &RetryPolicy,
    ) -> Result<ServerCapabilities, HandshakeError> {
        let mut attempt = 1;
        loop {
            match self.handshake(server_id, name, conn).await {
                Ok(caps) => return Ok(caps),
                Err(e) if e.is_retriable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(server = name, attempt, ?delay, error = %e, "handshake failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch every page of one listing. A listing the server refuses is
    /// treated as empty.
    async fn list_all(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        kind: ListKind,
    ) -> Result<Vec<Value>, HandshakeError> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .take()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page = match self.call(conn, kind.list_method(), params).await {
                Ok(page) => page,
                Err(HandshakeError::Transport(e)) => return Err(HandshakeError::Transport(e)),
                Err(e) => {
                    tracing::warn!(server = name, list = kind.list_method(), error = %e, "listing failed");
                    break;
                }
            };
            if let Some(items) = page.get(kind.result_field()).and_then(Value::as_array) {
                entries.extend(items.iter().cloned());
            }
            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(entries),
            }
        }
        if cursor.is_some() {
            tracing::warn!(server = name, list = kind.list_method(), "page cap reached, listing truncated");
        }
        Ok(entries)
    }

    /// Send one request and wait for its result within the handshake timeout.
    async fn call(
        &self,
        conn: &mut dyn Connection,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, HandshakeError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);
        conn.send(&codec::encode(&request.into())).await?;

        tokio::time::timeout(self.timeout, await_response(conn, &id))
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout))?
    }
}

/// Read frames until the response to `id` arrives.
///
/// Stale responses and notifications are skipped. Pings are answered, and
/// other server requests are refused since nothing upstream can serve them yet.
async fn await_response(conn: &mut dyn Connection, id: &RpcId) -> Result<Value, HandshakeError> {
    loop {
        let Some(frame) = conn.recv().await? else {
            return Err(HandshakeError::Transport(TransportError::Closed));
        };
        match codec::decode(&frame) {
            Ok(Envelope::Response(resp)) if resp.id.as_ref() == Some(id) => {
                return match resp.payload {
                    ResponsePayload::Result(v) => Ok(v),
                    ResponsePayload::Error(e) => Err(HandshakeError::Rejected {
                        code: e.code,
                        message: e.message,
                    }),
                };
            }
            Ok(Envelope::Response(resp)) => {
                tracing::debug!(label = conn.label(), id = ?resp.id, "skipping stale response");
            }
            Ok(Envelope::Request(req)) => {
                let reply = if req.method == "ping" {
                    JsonRpcResponse::success(Some(req.id), serde_json::json!({}))
                } else {
                    JsonRpcResponse::error(Some(req.id), JsonRpcError::method_not_found(&req.method))
                };
                conn.send(&codec::encode(&reply.into())).await?;
            }
            Ok(Envelope::Notification(n)) => {
                tracing::debug!(label = conn.label(), method = %n.method, "notification during handshake");
            }
            Err(e) => {
                tracing::warn!(label = conn.label(), error = %e, "undecodable frame during handshake");
            }
        }
    }
}
