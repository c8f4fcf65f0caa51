//! Audit events for session lifecycle and routing anomalies.
//!
//! The session reports through the [`AuditLogger`] trait and never cares
//! where events end up. [`TracingAuditLogger`] is the default sink.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum length for free-text detail fields.
const MAX_DETAIL_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditKind {
    #[serde(rename = "session.state")]
    SessionState,
    #[serde(rename = "handshake.failed")]
    HandshakeFailed,
    #[serde(rename = "capability.shadowed")]
    CapabilityShadowed,
    #[serde(rename = "response.orphan")]
    ResponseOrphan,
    #[serde(rename = "call.timeout")]
    CallTimeout,
    #[serde(rename = "downstream.lost")]
    DownstreamLost,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SessionState => "session.state",
            AuditKind::HandshakeFailed => "handshake.failed",
            AuditKind::CapabilityShadowed => "capability.shadowed",
            AuditKind::ResponseOrphan => "response.orphan",
            AuditKind::CallTimeout => "call.timeout",
            AuditKind::DownstreamLost => "downstream.lost",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, session_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: session_id.to_string(),
            server: None,
            method: None,
            details: None,
        }
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn details(mut self, details: impl AsRef<str>) -> Self {
        self.details = Some(sanitize_for_log(details.as_ref()));
        self
    }
}

/// Escape control characters and cap the length of text that came off the wire.
fn sanitize_for_log(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_DETAIL_LENGTH));
    for ch in input.chars().take(MAX_DETAIL_LENGTH) {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    if input.chars().count() > MAX_DETAIL_LENGTH {
        out.push_str("...[TRUNCATED]");
    }
    out
}

pub trait AuditLogger: Send + Sync {
    fn log(&self, event: &AuditEvent);
}

/// Writes every event as one structured `tracing` record on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: &AuditEvent) {
        let server = event.server.as_deref().unwrap_or("");
        let method = event.method.as_deref().unwrap_or("");
        let details = event.details.as_deref().unwrap_or("");
        match event.kind {
            AuditKind::HandshakeFailed
            | AuditKind::CapabilityShadowed
            | AuditKind::ResponseOrphan
            | AuditKind::DownstreamLost => tracing::warn!(
                target: "audit",
                event = %event.kind,
                session_id = %event.session_id,
                server,
                method,
                details,
                "audit"
            ),
            AuditKind::SessionState | AuditKind::CallTimeout => tracing::info!(
                target: "audit",
                event = %event.kind,
                session_id = %event.session_id,
                server,
                method,
                details,
                "audit"
            ),
        }
    }
}

/// Keeps events in memory. Used by tests to assert on what a session reported.
#[derive(Debug, Default)]
pub struct RecordingAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLogger {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditLogger for RecordingAuditLogger {
    fn log(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
