//! Arena of downstream handles, indexed by [`ServerId`].
//!
//! Entries are never removed during a session, so a `ServerId` stays valid
//! (and keeps its registration rank) after its server goes away.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::negotiator::ServerCapabilities;

/// Stable index of a downstream MCP server or A2A agent.
///
/// Ids are handed out in registration order, so comparing two ids compares
/// their registration rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u32);

impl ServerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ServerId {
    fn from(n: u32) -> Self {
        ServerId(n)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Negotiating,
    Available,
    Unavailable,
}

/// How frames reach a downstream.
#[derive(Debug)]
pub enum Downstream {
    /// MCP server behind a pump task. `outbound` is `None` until the pump is
    /// running and again after the server is lost.
    Mcp {
        outbound: Option<mpsc::Sender<Vec<u8>>>,
    },
    /// A2A agent reached through the HTTP bridge.
    Agent(AgentConfig),
}

#[derive(Debug)]
pub struct ServerEntry {
    pub id: ServerId,
    pub name: String,
    pub status: ServerStatus,
    pub downstream: Downstream,
    pub capabilities: Option<Arc<ServerCapabilities>>,
}

impl ServerEntry {
    pub fn is_agent(&self) -> bool {
        matches!(self.downstream, Downstream::Agent(_))
    }

    pub fn is_available(&self) -> bool {
        self.status == ServerStatus::Available
    }

    pub fn outbound(&self) -> Option<&mpsc::Sender<Vec<u8>>> {
        match &self.downstream {
            Downstream::Mcp { outbound } => outbound.as_ref(),
            Downstream::Agent(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerRegistry {
    entries: Vec<ServerEntry>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, downstream: Downstream) -> ServerId {
        let id = ServerId(self.entries.len() as u32);
        let status = match downstream {
            Downstream::Mcp { .. } => ServerStatus::Negotiating,
            Downstream::Agent(_) => ServerStatus::Available,
        };
        self.entries.push(ServerEntry {
            id,
            name: name.into(),
            status,
            downstream,
            capabilities: None,
        });
        id
    }

    pub fn get(&self, id: ServerId) -> Option<&ServerEntry> {
        self.entries.get(id.index())
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut ServerEntry> {
        self.entries.get_mut(id.index())
    }

    /// Display name of `id`, or its numeric form if unknown.
    pub fn name(&self, id: ServerId) -> String {
        self.get(id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerEntry> {
        self.entries.iter_mut()
    }

    pub fn available(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.iter().filter(|e| e.is_available())
    }

    /// Capability snapshots of every available downstream, in registration order.
    pub fn capability_snapshots(&self) -> Vec<Arc<ServerCapabilities>> {
        self.available()
            .filter_map(|e| e.capabilities.clone())
            .collect()
    }

    /// Mark `id` unavailable and drop its outbound queue, which stops its pump.
    pub fn mark_unavailable(&mut self, id: ServerId) {
        if let Some(entry) = self.get_mut(id) {
            entry.status = ServerStatus::Unavailable;
            if let Downstream::Mcp { outbound } = &mut entry.downstream {
                *outbound = None;
            }
        }
    }
}
