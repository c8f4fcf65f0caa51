//! One upstream client multiplexed over many downstreams.
//!
//! Every connection is owned by a pump task that moves frames between the
//! wire and the session. Inbound frames from all pumps land on one bounded
//! event queue; the session loop drains it and is the only code that touches
//! the correlation tables, the registry and the capability view.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, AuditLogger, TracingAuditLogger};
use crate::bridge::AgentBridge;
use crate::codec::{self, DecodeError, Envelope};
use crate::config::{DownstreamConfig, ProxyConfig};
use crate::correlation::{internal_to_wire, CallOrigin, CorrelationTable, PendingCall, Peer};
use crate::error::{normalize_downstream_error, ProxyError};
use crate::handlers;
use crate::negotiator::{
    AggregatedCapabilities, HandshakeError, Negotiator, ServerCapabilities, MAX_LIST_PAGES,
};
use crate::protocol::{
    CallToolResult, CancelledParams, Implementation, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListKind, McpErrorCode, MethodParams, ResponsePayload, RpcId,
};
use crate::registry::{Downstream, ServerId, ServerRegistry, ServerStatus};
use crate::router::{RouteKey, Router};
use crate::schema::{self, SchemaValidationError};
use crate::transport::{self, Connection, TransportError, MAX_FRAME_BYTES};

/// How long teardown waits for a pump to close its connection.
const PUMP_EXIT_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Negotiating,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    UpstreamClosed,
    UpstreamError(String),
    Shutdown,
    NoDownstreamAvailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests_forwarded: u64,
    pub responses_relayed: u64,
    pub timed_out: u64,
    pub orphans: u64,
    pub servers_lost: u64,
    /// Calls still in either correlation table when teardown began.
    pub pending_at_close: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub reason: CloseReason,
    pub stats: SessionStats,
}

/// Opens the connection to one configured downstream server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &DownstreamConfig) -> Result<Box<dyn Connection>, TransportError>;
}

/// Opens the transport named in the server's configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, server: &DownstreamConfig) -> Result<Box<dyn Connection>, TransportError> {
        transport::open(&server.name, &server.transport).await
    }
}

/// Asks a running session to drain and close.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    events: mpsc::Sender<SessionEvent>,
}

impl ShutdownHandle {
    pub async fn shutdown(&self) {
        if self.events.send(SessionEvent::Shutdown).await.is_err() {
            tracing::debug!("shutdown requested after session ended");
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Upstream(Vec<u8>),
    UpstreamClosed(Option<String>),
    Downstream {
        server: ServerId,
        frame: Vec<u8>,
    },
    DownstreamClosed {
        server: ServerId,
        error: Option<String>,
    },
    AgentReply {
        server: ServerId,
        internal_id: u64,
        outcome: Result<CallToolResult, JsonRpcError>,
    },
    FrameTooLarge {
        side: Side,
        len: usize,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Upstream,
    Downstream(ServerId),
}

impl Side {
    fn frame(self, frame: Vec<u8>) -> SessionEvent {
        match self {
            Side::Upstream => SessionEvent::Upstream(frame),
            Side::Downstream(server) => SessionEvent::Downstream { server, frame },
        }
    }

    fn closed(self, error: Option<String>) -> SessionEvent {
        match self {
            Side::Upstream => SessionEvent::UpstreamClosed(error),
            Side::Downstream(server) => SessionEvent::DownstreamClosed { server, error },
        }
    }
}

/// Move frames between `conn` and the session until either side is done.
///
/// The pump ends when the peer closes, on a transport error, or when the
/// session drops the outbound sender. The connection is closed on every path.
async fn pump(
    mut conn: Box<dyn Connection>,
    side: Side,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<SessionEvent>,
) {
    let error = loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = conn.send(&frame).await {
                        break Some(e.to_string());
                    }
                }
                None => break None,
            },
            inbound = conn.recv() => match inbound {
                Ok(Some(frame)) => {
                    if events.send(side.frame(frame)).await.is_err() {
                        break None;
                    }
                }
                Ok(None) => break None,
                Err(TransportError::FrameTooLarge { len }) => {
                    if events.send(SessionEvent::FrameTooLarge { side, len }).await.is_err() {
                        break None;
                    }
                }
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    if let Err(e) = conn.close().await {
        tracing::debug!(label = conn.label(), error = %e, "close failed");
    }
    let _ = events.send(side.closed(error)).await;
}

pub struct Session {
    id: String,
    config: Arc<ProxyConfig>,
    audit: Arc<dyn AuditLogger>,
    connector: Arc<dyn Connector>,
    upstream: Option<Box<dyn Connection>>,
    upstream_tx: Option<mpsc::Sender<Vec<u8>>>,
    state_tx: watch::Sender<SessionState>,
    caps_tx: watch::Sender<Arc<AggregatedCapabilities>>,
    caps: Arc<AggregatedCapabilities>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    registry: ServerRegistry,
    /// Upstream requests forwarded downstream, plus proxy-issued refreshes.
    pending: CorrelationTable,
    /// Downstream requests forwarded to the client.
    reverse: CorrelationTable,
    router: Router,
    bridge: Option<AgentBridge>,
    client_initialized: bool,
    drain_deadline: Option<Instant>,
    close_reason: Option<CloseReason>,
    pumps: Vec<JoinHandle<()>>,
    stats: SessionStats,
}

impl Session {
    pub fn new(config: Arc<ProxyConfig>, upstream: Box<dyn Connection>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(event_queue_depth(&config));
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let caps = Arc::new(AggregatedCapabilities::default());
        let (caps_tx, _) = watch::channel(caps.clone());
        let router = Router::new(config.strategy, config.min_trust_score);

        Self {
            id: Uuid::new_v4().to_string(),
            config,
            audit: Arc::new(TracingAuditLogger),
            connector: Arc::new(TransportConnector),
            upstream: Some(upstream),
            upstream_tx: None,
            state_tx,
            caps_tx,
            caps,
            events_tx,
            events_rx,
            registry: ServerRegistry::new(),
            pending: CorrelationTable::new(),
            reverse: CorrelationTable::new(),
            router,
            bridge: None,
            client_initialized: false,
            drain_deadline: None,
            close_reason: None,
            pumps: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_capabilities(&self) -> watch::Receiver<Arc<AggregatedCapabilities>> {
        self.caps_tx.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Drive the session to `Closed`.
    ///
    /// Fails only when no downstream completes its handshake.
    pub async fn run(self) -> Result<SessionSummary, ProxyError> {
        let span = tracing::info_span!("session", session_id = %self.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<SessionSummary, ProxyError> {
        self.set_state(SessionState::Connecting);
        if let Some(upstream) = self.upstream.take() {
            let (tx, rx) = mpsc::channel(self.upstream_queue_depth());
            self.upstream_tx = Some(tx);
            self.pumps.push(tokio::spawn(pump(
                upstream,
                Side::Upstream,
                rx,
                self.events_tx.clone(),
            )));
        }

        let targets = self.register_downstreams();
        self.set_state(SessionState::Negotiating);
        self.negotiate(targets).await;

        if self.registry.available().next().is_none() {
            tracing::error!("no downstream server available");
            self.close_reason = Some(CloseReason::NoDownstreamAvailable);
            self.teardown().await;
            return Err(ProxyError::NoDownstreamAvailable);
        }

        self.publish_capabilities();
        self.set_state(SessionState::Active);
        self.event_loop().await;
        self.teardown().await;

        Ok(SessionSummary {
            session_id: self.id.clone(),
            reason: self
                .close_reason
                .clone()
                .unwrap_or(CloseReason::UpstreamClosed),
            stats: self.stats.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------------

    /// Register MCP servers first, then agents, in configuration order.
    fn register_downstreams(&mut self) -> Vec<(ServerId, DownstreamConfig)> {
        let config = self.config.clone();
        let targets = config
            .servers
            .iter()
            .map(|server| {
                let id = self
                    .registry
                    .register(&server.name, Downstream::Mcp { outbound: None });
                (id, server.clone())
            })
            .collect();

        if config.agents.is_empty() {
            return targets;
        }
        let bridge = match AgentBridge::new(&config.proxy_id, config.min_trust_score) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                tracing::error!(error = %e, "cannot build agent bridge, agents disabled");
                None
            }
        };
        for agent in &config.agents {
            let id = self
                .registry
                .register(&agent.card.id, Downstream::Agent(agent.clone()));
            if let Some(entry) = self.registry.get_mut(id) {
                if bridge.is_some() {
                    entry.capabilities =
                        Some(Arc::new(ServerCapabilities::from_agent_card(id, &agent.card)));
                } else {
                    entry.status = ServerStatus::Unavailable;
                }
            }
        }
        self.bridge = bridge;
        targets
    }

    /// Connect to and handshake with every MCP server concurrently.
    async fn negotiate(&mut self, targets: Vec<(ServerId, DownstreamConfig)>) {
        let negotiator = Negotiator::new(
            self.config.protocol.clone(),
            Implementation {
                name: self.config.proxy_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            self.config.timeouts.handshake(),
        );
        let policy = &self.config.handshake_retry;
        let connector = &self.connector;
        let negotiator = &negotiator;

        let attempts = targets.iter().map(|(id, server)| async move {
            let result: Result<(ServerCapabilities, Box<dyn Connection>), HandshakeError> = async {
                let mut conn = connector.connect(server).await?;
                match negotiator
                    .handshake_with_retry(*id, &server.name, conn.as_mut(), policy)
                    .await
                {
                    Ok(caps) => Ok((caps, conn)),
                    Err(e) => {
                        let _ = conn.close().await;
                        Err(e)
                    }
                }
            }
            .await;
            (*id, result)
        });
        let results = futures::future::join_all(attempts).await;

        for (id, result) in results {
            match result {
                Ok((caps, conn)) => self.activate_server(id, caps, conn),
                Err(e) => {
                    let name = self.registry.name(id);
                    tracing::warn!(server = %name, error = %e, "downstream unavailable");
                    self.registry.mark_unavailable(id);
                    self.audit(
                        AuditEvent::new(AuditKind::HandshakeFailed, &self.id)
                            .server(&name)
                            .details(e.to_string()),
                    );
                }
            }
        }
    }

    fn activate_server(&mut self, id: ServerId, caps: ServerCapabilities, conn: Box<dyn Connection>) {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        if let Some(entry) = self.registry.get_mut(id) {
            entry.capabilities = Some(Arc::new(caps));
            entry.status = ServerStatus::Available;
            entry.downstream = Downstream::Mcp { outbound: Some(tx) };
        }
        self.pumps.push(tokio::spawn(pump(
            conn,
            Side::Downstream(id),
            rx,
            self.events_tx.clone(),
        )));
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    async fn event_loop(&mut self) {
        loop {
            if self.state() == SessionState::Draining && self.pending.is_empty() {
                break;
            }

            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                () = timer => self.on_deadline(Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending.next_deadline(),
            self.reverse.next_deadline(),
            self.drain_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Upstream(frame) => self.on_upstream_frame(&frame),
            SessionEvent::UpstreamClosed(None) => {
                tracing::info!("upstream closed");
                self.begin_drain(CloseReason::UpstreamClosed);
            }
            SessionEvent::UpstreamClosed(Some(error)) => {
                tracing::warn!(error = %error, "upstream failed");
                self.begin_drain(CloseReason::UpstreamError(error));
            }
            SessionEvent::Downstream { server, frame } => self.on_downstream_frame(server, &frame),
            SessionEvent::DownstreamClosed { server, error } => self.on_downstream_lost(server, error),
            SessionEvent::AgentReply {
                server,
                internal_id,
                outcome,
            } => self.on_agent_reply(server, internal_id, outcome),
            SessionEvent::FrameTooLarge { side, len } => self.on_oversized_frame(side, len),
            SessionEvent::Shutdown => {
                tracing::info!("shutdown requested");
                self.begin_drain(CloseReason::Shutdown);
            }
        }
    }

    fn begin_drain(&mut self, reason: CloseReason) {
        if self.state() != SessionState::Active {
            return;
        }
        self.close_reason = Some(reason);
        self.drain_deadline = Some(Instant::now() + self.config.timeouts.drain_grace());
        tracing::info!(in_flight = self.pending.len(), "draining");
        self.set_state(SessionState::Draining);
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.drain_deadline.is_some_and(|d| now >= d) {
            tracing::warn!(in_flight = self.pending.len(), "drain grace elapsed");
            for call in self.pending.drain_all() {
                self.expire_forward(call);
            }
            for call in self.reverse.drain_all() {
                self.expire_reverse(call);
            }
            return;
        }
        for call in self.pending.sweep_expired(now) {
            self.expire_forward(call);
        }
        for call in self.reverse.sweep_expired(now) {
            self.expire_reverse(call);
        }
    }

    fn expire_forward(&mut self, call: PendingCall) {
        self.stats.timed_out += 1;
        let Peer::Server(server) = call.target else {
            return;
        };
        let name = self.registry.name(server);
        tracing::warn!(
            server = %name,
            method = %call.method,
            internal_id = call.internal_id,
            "call timed out"
        );
        self.audit(
            AuditEvent::new(AuditKind::CallTimeout, &self.id)
                .server(&name)
                .method(&call.method),
        );
        self.send_cancel(server, call.wire_id(), "timeout");

        if let CallOrigin::Forwarded {
            from: Peer::Upstream,
            id,
        } = call.origin
        {
            let err = ProxyError::Timeout {
                method: call.method,
                retry_after: None,
            };
            self.reply_error(id, &err);
        }
    }

    fn expire_reverse(&mut self, call: PendingCall) {
        let wire_id = call.wire_id();
        if let CallOrigin::Forwarded {
            from: Peer::Server(server),
            id,
        } = call.origin
        {
            tracing::warn!(server = %self.registry.name(server), method = %call.method, "client did not answer in time");
            let timeout = ProxyError::Timeout {
                method: call.method.clone(),
                retry_after: None,
            };
            self.send_to_server(
                server,
                JsonRpcResponse::error(Some(id), JsonRpcError::from(&timeout)).into(),
            );
            self.send_upstream(cancelled(wire_id, "timeout").into());
        }
    }

    // ---------------------------------------------------------------------
    // Upstream traffic
    // ---------------------------------------------------------------------

    fn on_upstream_frame(&mut self, frame: &[u8]) {
        match codec::decode(frame) {
            Err(DecodeError::InvalidResponse {
                id: Some(id),
                reason,
            }) => self.on_malformed_client_response(id, reason),
            Err(e) => {
                tracing::warn!(error = %e, "rejecting upstream frame");
                if e.wants_reply() {
                    self.reply_upstream(JsonRpcResponse::error(e.id().cloned(), (&e).into()));
                }
            }
            Ok(Envelope::Request(req)) => self.on_client_request(req),
            Ok(Envelope::Notification(n)) => self.on_client_notification(n),
            Ok(Envelope::Response(resp)) => self.on_client_response(resp),
        }
    }

    fn on_client_request(&mut self, req: JsonRpcRequest) {
        if self.state() == SessionState::Draining {
            return self.reply_error(req.id, &ProxyError::SessionClosing);
        }

        let params = match MethodParams::parse(&req.method, req.params.as_ref()) {
            Ok(p) => p,
            Err(reason) => {
                return self.reply_upstream(JsonRpcResponse::error(
                    Some(req.id),
                    JsonRpcError::invalid_params(reason),
                ))
            }
        };

        // Initialization gate: only `initialize` and `ping` before the handshake.
        if !self.client_initialized
            && !matches!(params, MethodParams::Initialize(_) | MethodParams::Ping)
        {
            return self.reply_upstream(JsonRpcResponse::error(
                Some(req.id),
                JsonRpcError::invalid_request_with("Server not initialized"),
            ));
        }

        if let Some(resp) = handlers::dispatch(&req, &params, &self.caps, &self.config) {
            if matches!(params, MethodParams::Initialize(_)) {
                self.client_initialized = true;
            }
            return self.reply_upstream(resp);
        }

        let Some(key) = RouteKey::from_params(&params) else {
            return self.reply_upstream(JsonRpcResponse::error(
                Some(req.id),
                JsonRpcError::method_not_found(&req.method),
            ));
        };

        let id = req.id.clone();
        if let Err(e) = self.forward(req, params, &key) {
            tracing::debug!(route = %key, error = %e, "request not forwarded");
            self.reply_error(id, &e);
        }
    }

    fn forward(&mut self, req: JsonRpcRequest, params: MethodParams, key: &RouteKey) -> Result<(), ProxyError> {
        let server = self
            .router
            .route(key, &self.caps, |id| self.pending.in_flight(id))?;

        if let MethodParams::CallTool(call) = &params {
            if let Some(schema) = self.caps.tool_schema(server, &call.name) {
                let args = call.arguments.clone().unwrap_or_else(|| json!({}));
                match schema::validate_value(schema, &args) {
                    Ok(()) => {}
                    Err(e @ SchemaValidationError::ValidationFailed(_)) => return Err(e.into()),
                    Err(e) => {
                        tracing::debug!(tool = %call.name, error = %e, "tool schema unusable, skipping validation")
                    }
                }
            }
        }

        let timeout = self.config.timeouts.request_timeout_for(&req.method);
        let name = self.registry.name(server);
        let outbound = match self.registry.get(server).map(|e| &e.downstream) {
            Some(Downstream::Agent(agent)) => {
                let agent = agent.clone();
                return self.forward_to_agent(server, agent, req, params, timeout);
            }
            Some(Downstream::Mcp { outbound: Some(tx) }) => tx.clone(),
            _ => return Err(ProxyError::DownstreamUnavailable { server: name }),
        };

        let permit = outbound.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => ProxyError::ServerBusy {
                server: name.clone(),
            },
            mpsc::error::TrySendError::Closed(()) => ProxyError::DownstreamUnavailable {
                server: name.clone(),
            },
        })?;
        let internal_id = self.pending.register_outbound(
            Peer::Upstream,
            req.id,
            Peer::Server(server),
            &req.method,
            timeout,
            Instant::now(),
        )?;

        tracing::debug!(server = %name, method = %req.method, internal_id, "forwarding");
        let rewritten = JsonRpcRequest::new(internal_to_wire(internal_id), req.method, req.params);
        permit.send(codec::encode(&rewritten.into()));
        self.stats.requests_forwarded += 1;
        Ok(())
    }

    fn forward_to_agent(
        &mut self,
        server: ServerId,
        agent: crate::config::AgentConfig,
        req: JsonRpcRequest,
        params: MethodParams,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let MethodParams::CallTool(call) = params else {
            return Err(ProxyError::DownstreamUnavailable {
                server: agent.card.id,
            });
        };
        let Some(bridge) = self.bridge.clone() else {
            return Err(ProxyError::DownstreamUnavailable {
                server: agent.card.id,
            });
        };
        let internal_id = self.pending.register_outbound(
            Peer::Upstream,
            req.id,
            Peer::Server(server),
            &req.method,
            timeout,
            Instant::now(),
        )?;
        tracing::debug!(agent = %agent.card.id, tool = %call.name, internal_id, "forwarding to agent");
        self.stats.requests_forwarded += 1;

        let events = self.events_tx.clone();
        let session_id = self.id.clone();
        tokio::spawn(
            async move {
                let outcome = bridge
                    .call_tool(&agent, &call, &session_id, timeout)
                    .await
                    .map_err(|e| {
                        tracing::warn!(agent = %agent.card.id, error = %e, "agent call failed");
                        JsonRpcError::from(&e)
                    });
                let _ = events
                    .send(SessionEvent::AgentReply {
                        server,
                        internal_id,
                        outcome,
                    })
                    .await;
            }
            .in_current_span(),
        );
        Ok(())
    }

    fn on_client_notification(&mut self, n: JsonRpcNotification) {
        match n.method.as_str() {
            "notifications/initialized" => tracing::debug!("client confirmed initialization"),
            "notifications/cancelled" => {
                let Some(params) = n
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                else {
                    return;
                };
                if let Some(call) = self.pending.cancel(Peer::Upstream, &params.request_id) {
                    tracing::debug!(method = %call.method, internal_id = call.internal_id, "client cancelled request");
                    if let Peer::Server(server) = call.target {
                        let reason = params.reason.as_deref().unwrap_or("cancelled by client");
                        self.send_cancel(server, call.wire_id(), reason);
                    }
                }
            }
            "notifications/roots/list_changed" => {
                let targets: Vec<ServerId> = self
                    .registry
                    .available()
                    .filter(|e| !e.is_agent())
                    .map(|e| e.id)
                    .collect();
                for server in targets {
                    self.send_to_server(server, n.clone().into());
                }
            }
            other => tracing::debug!(method = other, "dropping client notification"),
        }
    }

    /// The client answered a server request with something unreadable.
    fn on_malformed_client_response(&mut self, id: RpcId, reason: String) {
        tracing::warn!(id = %id, reason = %reason, "malformed client response");
        match self.reverse.resolve_inbound(Peer::Upstream, &id) {
            Ok(PendingCall {
                origin:
                    CallOrigin::Forwarded {
                        from: Peer::Server(server),
                        id: original,
                    },
                ..
            }) => {
                let err = JsonRpcError::internal_error(format!("malformed client response: {reason}"));
                self.send_to_server(server, JsonRpcResponse::error(Some(original), err).into());
            }
            Ok(_) => {}
            Err(_) => self.on_orphan(None, &id),
        }
    }

    fn on_oversized_frame(&mut self, side: Side, len: usize) {
        match side {
            Side::Upstream => {
                tracing::warn!(len, limit = MAX_FRAME_BYTES, "upstream frame exceeds size limit");
                let err = JsonRpcError::parse_error()
                    .with_data(json!({ "len": len, "limit": MAX_FRAME_BYTES }));
                self.reply_upstream(JsonRpcResponse::error(None, err));
            }
            Side::Downstream(server) => {
                tracing::warn!(server = %self.registry.name(server), len, limit = MAX_FRAME_BYTES, "downstream frame exceeds size limit, dropped");
            }
        }
    }

    /// The client answering a request a downstream server sent it.
    fn on_client_response(&mut self, resp: JsonRpcResponse) {
        let Some(id) = resp.id.clone() else {
            tracing::warn!("client sent an error without id");
            return;
        };
        match self.reverse.resolve_inbound(Peer::Upstream, &id) {
            Ok(PendingCall {
                origin:
                    CallOrigin::Forwarded {
                        from: Peer::Server(server),
                        id: original,
                    },
                ..
            }) => {
                let restored = JsonRpcResponse {
                    id: Some(original),
                    payload: resp.payload,
                };
                self.send_to_server(server, restored.into());
            }
            Ok(_) => {}
            Err(_) => self.on_orphan(None, &id),
        }
    }

    // ---------------------------------------------------------------------
    // Downstream traffic
    // ---------------------------------------------------------------------

    fn on_downstream_frame(&mut self, server: ServerId, frame: &[u8]) {
        match codec::decode(frame) {
            Err(DecodeError::InvalidResponse {
                id: Some(id),
                reason,
            }) => self.on_malformed_response(server, id, reason),
            Err(e) => {
                tracing::warn!(server = %self.registry.name(server), error = %e, "undecodable downstream frame");
                if let (true, Some(id)) = (e.wants_reply(), e.id().cloned()) {
                    self.send_to_server(server, JsonRpcResponse::error(Some(id), (&e).into()).into());
                }
            }
            Ok(Envelope::Response(resp)) => self.on_downstream_response(server, resp),
            Ok(Envelope::Request(req)) => self.on_downstream_request(server, req),
            Ok(Envelope::Notification(n)) => self.on_downstream_notification(server, n),
        }
    }

    fn on_downstream_response(&mut self, server: ServerId, resp: JsonRpcResponse) {
        let Some(id) = resp.id.clone() else {
            return self.on_orphan(Some(server), &RpcId::Str("null".into()));
        };
        let call = match self.pending.resolve_inbound(Peer::Server(server), &id) {
            Ok(call) => call,
            Err(_) => return self.on_orphan(Some(server), &id),
        };

        match call.origin {
            CallOrigin::Forwarded {
                from: Peer::Upstream,
                id: external,
            } => {
                let name = self.registry.name(server);
                let payload = match resp.payload {
                    ResponsePayload::Error(e) => ResponsePayload::Error(normalize_downstream_error(e, &name)),
                    ok => ok,
                };
                tracing::debug!(
                    server = %name,
                    method = %call.method,
                    internal_id = call.internal_id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "relaying response"
                );
                self.stats.responses_relayed += 1;
                self.reply_upstream(JsonRpcResponse {
                    id: Some(external),
                    payload,
                });
            }
            CallOrigin::Forwarded { .. } => {}
            CallOrigin::Refresh {
                kind,
                collected,
                page,
            } => self.continue_refresh(server, kind, collected, page, resp.payload),
        }
    }

    /// A reply from `server` that cannot be decoded still settles its call.
    fn on_malformed_response(&mut self, server: ServerId, id: RpcId, reason: String) {
        let name = self.registry.name(server);
        tracing::warn!(server = %name, id = %id, reason = %reason, "malformed downstream response");
        let call = match self.pending.resolve_inbound(Peer::Server(server), &id) {
            Ok(call) => call,
            Err(_) => return self.on_orphan(Some(server), &id),
        };
        match call.origin {
            CallOrigin::Forwarded {
                from: Peer::Upstream,
                id: external,
            } => {
                let err = JsonRpcError::new(McpErrorCode::ServerError, "Malformed downstream response")
                    .with_data(json!({ "server": name, "reason": reason }));
                self.reply_upstream(JsonRpcResponse::error(Some(external), err));
            }
            CallOrigin::Refresh { kind, .. } => {
                tracing::warn!(server = %name, list = kind.list_method(), "refresh failed, keeping previous entries");
            }
            CallOrigin::Forwarded { .. } => {}
        }
    }

    fn on_downstream_request(&mut self, server: ServerId, req: JsonRpcRequest) {
        if req.method == "ping" {
            return self.send_to_server(
                server,
                JsonRpcResponse::success(Some(req.id), handlers::health::handle()).into(),
            );
        }
        if self.state() == SessionState::Draining {
            return self.send_to_server(
                server,
                JsonRpcResponse::error(Some(req.id), JsonRpcError::from(&ProxyError::SessionClosing))
                    .into(),
            );
        }

        let timeout = self.config.timeouts.request_timeout_for(&req.method);
        match self.reverse.register_outbound(
            Peer::Server(server),
            req.id.clone(),
            Peer::Upstream,
            &req.method,
            timeout,
            Instant::now(),
        ) {
            Ok(internal_id) => {
                tracing::debug!(server = %self.registry.name(server), method = %req.method, internal_id, "relaying server request to client");
                let rewritten = JsonRpcRequest::new(internal_to_wire(internal_id), req.method, req.params);
                self.send_upstream(rewritten.into());
            }
            Err(e) => {
                let err = JsonRpcError::from(&ProxyError::from(e));
                self.send_to_server(server, JsonRpcResponse::error(Some(req.id), err).into());
            }
        }
    }

    fn on_downstream_notification(&mut self, server: ServerId, n: JsonRpcNotification) {
        if let Some(kind) = ListKind::from_changed_notification(&n.method) {
            return self.refresh_page(server, kind, Vec::new(), 0, None);
        }
        if n.method == "notifications/cancelled" {
            let Some(params) = n
                .params
                .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
            else {
                return;
            };
            if let Some(call) = self.reverse.cancel(Peer::Server(server), &params.request_id) {
                let reason = params.reason.as_deref().unwrap_or("cancelled by server");
                self.send_upstream(cancelled(call.wire_id(), reason).into());
            }
            return;
        }
        self.send_upstream(n.into());
    }

    fn on_agent_reply(
        &mut self,
        server: ServerId,
        internal_id: u64,
        outcome: Result<CallToolResult, JsonRpcError>,
    ) {
        let wire_id = internal_to_wire(internal_id);
        let call = match self.pending.resolve_inbound(Peer::Server(server), &wire_id) {
            Ok(call) => call,
            Err(_) => return self.on_orphan(Some(server), &wire_id),
        };
        let CallOrigin::Forwarded {
            from: Peer::Upstream,
            id,
        } = call.origin
        else {
            return;
        };
        let resp = match outcome {
            Ok(result) => match serde_json::to_value(result) {
                Ok(v) => JsonRpcResponse::success(Some(id), v),
                Err(e) => JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string())),
            },
            Err(e) => JsonRpcResponse::error(Some(id), e),
        };
        self.stats.responses_relayed += 1;
        self.reply_upstream(resp);
    }

    fn on_orphan(&mut self, server: Option<ServerId>, id: &RpcId) {
        self.stats.orphans += 1;
        let from = server.map_or_else(|| "upstream".to_string(), |s| self.registry.name(s));
        tracing::warn!(from = %from, id = %id, "dropping orphan response");
        self.audit(
            AuditEvent::new(AuditKind::ResponseOrphan, &self.id)
                .server(&from)
                .details(format!("id {id}")),
        );
    }

    fn on_downstream_lost(&mut self, server: ServerId, error: Option<String>) {
        let Some(entry) = self.registry.get(server) else {
            return;
        };
        if entry.status != ServerStatus::Available {
            return;
        }
        let name = entry.name.clone();
        tracing::warn!(server = %name, error = error.as_deref().unwrap_or("closed"), "downstream lost");
        self.audit(
            AuditEvent::new(AuditKind::DownstreamLost, &self.id)
                .server(&name)
                .details(error.as_deref().unwrap_or("connection closed")),
        );
        self.stats.servers_lost += 1;

        let kinds = self.caps.kinds_served_by(server);
        self.registry.mark_unavailable(server);

        let lost = ProxyError::DownstreamUnavailable {
            server: name.clone(),
        };
        for call in self.pending.remove_for_server(server) {
            if let CallOrigin::Forwarded {
                from: Peer::Upstream,
                id,
            } = call.origin
            {
                self.reply_error(id, &lost);
            }
        }
        for call in self.reverse.remove_for_server(server) {
            self.send_upstream(cancelled(call.wire_id(), "server disconnected").into());
        }

        self.publish_capabilities();
        if self.client_initialized {
            for kind in kinds {
                self.send_upstream(JsonRpcNotification::new(kind.changed_notification(), None).into());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Capability refresh
    // ---------------------------------------------------------------------

    /// Ask `server` for one page of `kind`, carrying what was collected so far.
    fn refresh_page(
        &mut self,
        server: ServerId,
        kind: ListKind,
        collected: Vec<Value>,
        page: usize,
        cursor: Option<String>,
    ) {
        let Some(outbound) = self.registry.get(server).and_then(|e| e.outbound().cloned()) else {
            return;
        };
        let Ok(permit) = outbound.try_reserve() else {
            tracing::warn!(server = %self.registry.name(server), list = kind.list_method(), "refresh skipped, queue full");
            return;
        };
        let timeout = self.config.timeouts.request_timeout_for(kind.list_method());
        let internal_id = self.pending.register_internal(
            Peer::Server(server),
            kind.list_method(),
            CallOrigin::Refresh {
                kind,
                collected,
                page,
            },
            timeout,
            Instant::now(),
        );
        let params = cursor.map(|c| json!({ "cursor": c }));
        let request = JsonRpcRequest::new(internal_to_wire(internal_id), kind.list_method(), params);
        permit.send(codec::encode(&request.into()));
    }

    fn continue_refresh(
        &mut self,
        server: ServerId,
        kind: ListKind,
        mut collected: Vec<Value>,
        page: usize,
        payload: ResponsePayload,
    ) {
        let result = match payload {
            ResponsePayload::Result(v) => v,
            ResponsePayload::Error(e) => {
                tracing::warn!(server = %self.registry.name(server), list = kind.list_method(), error = %e.message, "refresh failed");
                return;
            }
        };
        if let Some(items) = result.get(kind.result_field()).and_then(Value::as_array) {
            collected.extend(items.iter().cloned());
        }
        match result.get("nextCursor").and_then(Value::as_str) {
            Some(cursor) if !cursor.is_empty() && page + 1 < MAX_LIST_PAGES => {
                let cursor = cursor.to_string();
                return self.refresh_page(server, kind, collected, page + 1, Some(cursor));
            }
            Some(cursor) if !cursor.is_empty() => {
                tracing::warn!(server = %self.registry.name(server), list = kind.list_method(), "page cap reached, listing truncated");
            }
            _ => {}
        }

        let Some(entry) = self.registry.get_mut(server) else {
            return;
        };
        let Some(current) = entry.capabilities.as_ref() else {
            return;
        };
        let mut updated = ServerCapabilities::clone(current);
        updated.replace_entries(kind, collected);
        entry.capabilities = Some(Arc::new(updated));

        tracing::info!(server = %entry.name, list = kind.list_method(), "capabilities refreshed");
        self.publish_capabilities();
        if self.client_initialized {
            self.send_upstream(JsonRpcNotification::new(kind.changed_notification(), None).into());
        }
    }

    /// Rebuild the merged view from the registry and republish it.
    fn publish_capabilities(&mut self) {
        let merged = AggregatedCapabilities::build(&self.registry.capability_snapshots());
        for entry in &merged.shadowed {
            if self.caps.shadowed.contains(entry) {
                continue;
            }
            let winner = self.registry.name(entry.winner);
            let loser = self.registry.name(entry.shadowed);
            tracing::warn!(
                list = entry.kind.list_method(),
                name = %entry.name,
                winner = %winner,
                shadowed = %loser,
                "name collision, first registered server wins"
            );
            self.audit(
                AuditEvent::new(AuditKind::CapabilityShadowed, &self.id)
                    .server(&loser)
                    .details(format!("{} '{}' served by {winner}", entry.kind.result_field(), entry.name)),
            );
        }
        self.caps = Arc::new(merged);
        self.caps_tx.send_replace(self.caps.clone());
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    async fn teardown(&mut self) {
        self.stats.pending_at_close = (self.pending.len() + self.reverse.len()) as u64;
        for call in self.pending.drain_all() {
            if let CallOrigin::Forwarded {
                from: Peer::Upstream,
                id,
            } = call.origin
            {
                self.reply_error(id, &ProxyError::SessionClosing);
            }
        }
        self.reverse.drain_all();
        self.set_state(SessionState::Closed);

        // Nothing more is read; pumps see their queues close and shut down.
        self.events_rx.close();
        for entry in self.registry.iter_mut() {
            if let Downstream::Mcp { outbound } = &mut entry.downstream {
                *outbound = None;
            }
        }
        self.upstream_tx = None;

        for handle in self.pumps.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(PUMP_EXIT_GRACE, handle).await.is_err() {
                tracing::debug!("pump did not exit in time, aborting");
                abort.abort();
            }
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: SessionState) {
        self.state_tx.send_replace(state);
        tracing::info!(state = %state, "session state");
        self.audit(AuditEvent::new(AuditKind::SessionState, &self.id).details(state.as_str()));
    }

    fn audit(&self, event: AuditEvent) {
        self.audit.log(&event);
    }

    fn upstream_queue_depth(&self) -> usize {
        2 * event_queue_depth(&self.config)
    }

    /// Queue a frame for the client. A client that lets the queue fill up is
    /// not reading; the frame is dropped and the session drains.
    fn send_upstream(&mut self, envelope: Envelope) {
        let Some(tx) = &self.upstream_tx else {
            return;
        };
        match tx.try_send(codec::encode(&envelope)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::error!(depth = self.upstream_queue_depth(), "client is not reading, dropping frame");
                self.begin_drain(CloseReason::UpstreamError("client stopped reading".into()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("upstream gone, dropping frame");
            }
        }
    }

    fn reply_upstream(&mut self, resp: JsonRpcResponse) {
        self.send_upstream(resp.into());
    }

    fn reply_error(&mut self, id: RpcId, err: &ProxyError) {
        self.reply_upstream(JsonRpcResponse::error(Some(id), err.into()));
    }

    fn send_to_server(&self, server: ServerId, envelope: Envelope) {
        let Some(tx) = self.registry.get(server).and_then(|e| e.outbound()) else {
            return;
        };
        if let Err(e) = tx.try_send(codec::encode(&envelope)) {
            tracing::warn!(server = %self.registry.name(server), error = %e, "dropping frame for downstream");
        }
    }

    fn send_cancel(&self, server: ServerId, request_id: RpcId, reason: &str) {
        self.send_to_server(server, cancelled(request_id, reason).into());
    }
}

/// One full queue per downstream plus one for the client.
///
/// The client's outbound queue is twice this, so replies to a full event
/// queue always fit while its pump is blocked on delivery.
fn event_queue_depth(config: &ProxyConfig) -> usize {
    config.queue_depth.max(1) * (config.servers.len() + config.agents.len() + 1)
}

fn cancelled(request_id: RpcId, reason: &str) -> JsonRpcNotification {
    let params = CancelledParams {
        request_id,
        reason: Some(reason.to_string()),
    };
    JsonRpcNotification::new("notifications/cancelled", serde_json::to_value(params).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_notification_shape() {
        let n = cancelled(RpcId::from(7), "timeout");
        assert_eq!(n.method, "notifications/cancelled");
        assert_eq!(
            n.params,
            Some(json!({"requestId": 7, "reason": "timeout"}))
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::Draining.to_string(), "draining");
        assert_eq!(SessionState::Closed.as_str(), "closed");
    }
}
