//! Shared harness for session tests: scripted MCP servers over in-memory
//! pipes, a connector that hands them out by name, and a line-oriented client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use mcp_a2a_proxy::audit::RecordingAuditLogger;
use mcp_a2a_proxy::config::{DownstreamConfig, ProxyConfig};
use mcp_a2a_proxy::error::ProxyError;
use mcp_a2a_proxy::session::{
    Connector, Session, SessionState, SessionSummary, ShutdownHandle,
};
use mcp_a2a_proxy::transport::{Connection, StdioConnection, TransportError};

pub const PIPE_CAPACITY: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn server(name: &str) -> Value {
    json!({"name": name, "transport": {"type": "stdio", "command": name}})
}

pub fn config(value: Value) -> ProxyConfig {
    let config: ProxyConfig = serde_json::from_value(value).unwrap();
    config.validate().unwrap();
    config
}

pub fn tool(name: &str) -> Value {
    json!({"name": name, "inputSchema": {"type": "object"}})
}

// ---------------------------------------------------------------------------
// Scripted MCP server
// ---------------------------------------------------------------------------

pub enum Control {
    Send(Value),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub tools: Vec<Value>,
    /// Leave this many `initialize` calls unanswered.
    pub ignore_initialize: usize,
    /// Then answer this many with an unsupported protocol version.
    pub bad_versions: usize,
    /// Never answer `tools/call`.
    pub silent_calls: bool,
    /// Stop reading input once the first `tools/list` is answered.
    pub stall_after_handshake: bool,
    pub pipe_capacity: Option<usize>,
}

pub struct MockServer {
    pub tools: Arc<Mutex<Vec<Value>>>,
    control: mpsc::UnboundedSender<Control>,
    received: mpsc::UnboundedReceiver<Value>,
}

impl MockServer {
    pub fn spawn(name: &str, script: Script) -> (Self, Box<dyn Connection>) {
        let (proxy_side, server_side) =
            tokio::io::duplex(script.pipe_capacity.unwrap_or(PIPE_CAPACITY));
        let (read, write) = tokio::io::split(proxy_side);
        let conn = StdioConnection::new(name, read, write);

        let tools = Arc::new(Mutex::new(script.tools.clone()));
        let (control, control_rx) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            server_side,
            name.to_string(),
            tools.clone(),
            script,
            control_rx,
            received_tx,
        ));

        (
            Self {
                tools,
                control,
                received,
            },
            Box::new(conn),
        )
    }

    pub fn send(&self, msg: Value) {
        let _ = self.control.send(Control::Send(msg));
    }

    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Next message the server received whose `method` matches.
    pub async fn expect(&mut self, method: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.received.recv())
                .await
                .expect("timed out waiting for downstream message")
                .expect("mock server stopped");
            if msg["method"] == method {
                return msg;
            }
        }
    }

    /// Next message the server received that is a response.
    pub async fn expect_response(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.received.recv())
                .await
                .expect("timed out waiting for downstream message")
                .expect("mock server stopped");
            if msg.get("method").is_none() {
                return msg;
            }
        }
    }

    pub fn received_now(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = self.received.try_recv() {
            out.push(msg);
        }
        out
    }
}

async fn serve(
    stream: DuplexStream,
    name: String,
    tools: Arc<Mutex<Vec<Value>>>,
    script: Script,
    mut control: mpsc::UnboundedReceiver<Control>,
    received: mpsc::UnboundedSender<Value>,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut ignore_initialize = script.ignore_initialize;
    let mut bad_versions = script.bad_versions;
    let mut stalled = false;

    loop {
        tokio::select! {
            line = lines.next_line(), if !stalled => {
                let Ok(Some(line)) = line else { break };
                let Ok(msg) = serde_json::from_str::<Value>(&line) else { continue };
                let _ = received.send(msg.clone());

                let (Some(method), Some(id)) = (msg["method"].as_str(), msg.get("id")) else {
                    continue;
                };
                let result = match method {
                    "initialize" if ignore_initialize > 0 => {
                        ignore_initialize -= 1;
                        None
                    }
                    "initialize" => {
                        let version = if bad_versions > 0 {
                            bad_versions -= 1;
                            json!("1999-01-01")
                        } else {
                            msg["params"]["protocolVersion"].clone()
                        };
                        Some(json!({
                            "protocolVersion": version,
                            "capabilities": {"tools": {"listChanged": true}},
                            "serverInfo": {"name": name, "version": "0.0.1"}
                        }))
                    }
                    "tools/list" => {
                        if script.stall_after_handshake {
                            stalled = true;
                        }
                        Some(json!({"tools": tools.lock().unwrap().clone()}))
                    }
                    "tools/call" if script.silent_calls => None,
                    "tools/call" => Some(json!({
                        "content": [{"type": "text", "text": format!("{name}:{}", msg["params"]["name"].as_str().unwrap_or(""))}]
                    })),
                    "ping" => Some(json!({})),
                    _ => {
                        let reply = json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}});
                        write_line(&mut write, &reply).await;
                        None
                    }
                };
                if let Some(result) = result {
                    write_line(&mut write, &json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
            }
            ctl = control.recv() => match ctl {
                Some(Control::Send(msg)) => write_line(&mut write, &msg).await,
                Some(Control::Close) | None => break,
            },
        }
    }
}

async fn write_line(write: &mut WriteHalf<DuplexStream>, msg: &Value) {
    let _ = write.write_all(format!("{msg}\n").as_bytes()).await;
    let _ = write.flush().await;
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MapConnector {
    conns: Mutex<HashMap<String, Box<dyn Connection>>>,
}

impl MapConnector {
    pub fn with(self, name: &str, conn: Box<dyn Connection>) -> Self {
        self.conns.lock().unwrap().insert(name.to_string(), conn);
        self
    }
}

#[async_trait]
impl Connector for MapConnector {
    async fn connect(&self, server: &DownstreamConfig) -> Result<Box<dyn Connection>, TransportError> {
        self.conns
            .lock()
            .unwrap()
            .remove(&server.name)
            .ok_or(TransportError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Upstream client
// ---------------------------------------------------------------------------

pub struct TestClient {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    /// Notifications and server requests seen while waiting for responses.
    pub backlog: Vec<Value>,
}

impl TestClient {
    pub fn pair() -> (Self, Box<dyn Connection>) {
        Self::pair_with_capacity(PIPE_CAPACITY)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Box<dyn Connection>) {
        let (client_side, proxy_side) = tokio::io::duplex(capacity);
        let (read, write) = tokio::io::split(proxy_side);
        let conn = StdioConnection::new("upstream", read, write);
        let (read, writer) = tokio::io::split(client_side);
        (
            Self {
                lines: BufReader::new(read).lines(),
                writer,
                backlog: Vec::new(),
            },
            Box::new(conn),
        )
    }

    pub async fn send(&mut self, msg: Value) {
        self.writer
            .write_all(format!("{msg}\n").as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Write raw bytes followed by a newline.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for proxy output")
            .unwrap()
            .expect("proxy closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Send a request and wait for the response with the same id.
    pub async fn call(&mut self, id: Value, method: &str, params: Value) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        self.response(&id).await
    }

    pub async fn response(&mut self, id: &Value) -> Value {
        loop {
            let msg = self.recv().await;
            if msg.get("method").is_none() && msg["id"] == *id {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    /// Next message carrying `method`, from the backlog first.
    pub async fn expect(&mut self, method: &str) -> Value {
        if let Some(pos) = self.backlog.iter().position(|m| m["method"] == method) {
            return self.backlog.remove(pos);
        }
        loop {
            let msg = self.recv().await;
            if msg["method"] == method {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    pub async fn initialize(&mut self) -> Value {
        let resp = self
            .call(
                json!(0),
                "initialize",
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "1.0"}
                }),
            )
            .await;
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        resp
    }
}

// ---------------------------------------------------------------------------
// Session harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub client: TestClient,
    pub audit: Arc<RecordingAuditLogger>,
    pub state: watch::Receiver<SessionState>,
    pub shutdown: ShutdownHandle,
    pub session: JoinHandle<Result<SessionSummary, ProxyError>>,
}

pub fn start(config: ProxyConfig, connector: MapConnector) -> Harness {
    start_with_client_pipe(config, connector, PIPE_CAPACITY)
}

/// Like [`start`], with `capacity` bytes of buffering between client and proxy.
pub fn start_with_client_pipe(config: ProxyConfig, connector: MapConnector, capacity: usize) -> Harness {
    let (client, upstream) = TestClient::pair_with_capacity(capacity);
    let audit = Arc::new(RecordingAuditLogger::default());
    let session = Session::new(Arc::new(config), upstream)
        .with_audit(audit.clone())
        .with_connector(Arc::new(connector));
    let state = session.subscribe_state();
    let shutdown = session.shutdown_handle();
    Harness {
        client,
        audit,
        state,
        shutdown,
        session: tokio::spawn(session.run()),
    }
}

impl Harness {
    pub async fn wait_for_state(&mut self, wanted: SessionState) {
        tokio::time::timeout(RECV_TIMEOUT, self.state.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for session state")
            .expect("session dropped its state channel");
    }
}

// ---------------------------------------------------------------------------
// A2A agent over plain HTTP
// ---------------------------------------------------------------------------

/// Minimal A2A agent on a local port that answers every call with `result`.
/// Returns the endpoint and a channel of the request bodies it received.
pub async fn spawn_agent(result: Value) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let body = loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break None;
                }
                raw.extend_from_slice(&buf[..n]);
                let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + len {
                    break Some(raw[end + 4..end + 4 + len].to_vec());
                }
            };
            let Some(body) = body else { continue };
            let request: Value = serde_json::from_slice(&body).unwrap();
            let reply = json!({
                "id": request["id"],
                "from": request["to"],
                "to": request["from"],
                "result": result,
                "context": {
                    "correlation_id": request["context"]["correlation_id"],
                    "processing_time": 3,
                    "timestamp": "2025-01-01T00:00:00Z"
                }
            })
            .to_string();
            let _ = seen_tx.send(request);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                reply.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{addr}/a2a"), seen)
}
