//! Picks the downstream that serves a request.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::negotiator::AggregatedCapabilities;
use crate::protocol::a2a::{AgentCard, TaskRequest};
use crate::protocol::{CompletionRef, ListKind, MethodParams};
use crate::registry::ServerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    CapabilityMatch,
    RoundRobin,
    LeastLoaded,
    HighestTrust,
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capability_match" => Ok(Self::CapabilityMatch),
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "highest_trust" => Ok(Self::HighestTrust),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// The name a request is routed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Tool(String),
    Resource(String),
    Prompt(String),
}

impl RouteKey {
    /// Route key of a request, or `None` for methods that are not routed by name.
    pub fn from_params(params: &MethodParams) -> Option<Self> {
        Some(match params {
            MethodParams::CallTool(p) => RouteKey::Tool(p.name.clone()),
            MethodParams::ReadResource(p)
            | MethodParams::Subscribe(p)
            | MethodParams::Unsubscribe(p) => RouteKey::Resource(p.uri.clone()),
            MethodParams::GetPrompt(p) => RouteKey::Prompt(p.name.clone()),
            MethodParams::Complete(p) => match &p.reference {
                CompletionRef::Prompt { name } => RouteKey::Prompt(name.clone()),
                CompletionRef::Resource { uri } => RouteKey::Resource(uri.clone()),
            },
            _ => return None,
        })
    }

    pub fn kind(&self) -> ListKind {
        match self {
            RouteKey::Tool(_) => ListKind::Tools,
            RouteKey::Resource(_) => ListKind::Resources,
            RouteKey::Prompt(_) => ListKind::Prompts,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RouteKey::Tool(n) | RouteKey::Resource(n) | RouteKey::Prompt(n) => n,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Tool(n) => write!(f, "tool '{n}'"),
            RouteKey::Resource(n) => write!(f, "resource '{n}'"),
            RouteKey::Prompt(n) => write!(f, "prompt '{n}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no available server provides {0}")]
    NoCapableServer(RouteKey),
}

pub struct Router {
    strategy: RoutingStrategy,
    min_trust_score: Option<f64>,
    cursors: HashMap<RouteKey, usize>,
}

impl Router {
    pub fn new(strategy: RoutingStrategy, min_trust_score: Option<f64>) -> Self {
        Self {
            strategy,
            min_trust_score,
            cursors: HashMap::new(),
        }
    }

    /// Choose a provider for `key`. `load` reports the in-flight calls per server.
    ///
    /// Candidates are taken in registration order, which also breaks every tie.
    /// Agents below the configured minimum trust score never qualify.
    pub fn route(
        &mut self,
        key: &RouteKey,
        caps: &AggregatedCapabilities,
        load: impl Fn(ServerId) -> usize,
    ) -> Result<ServerId, RoutingError> {
        let candidates: Vec<ServerId> = caps
            .providers(key.kind(), key.name())
            .iter()
            .copied()
            .filter(|id| match (caps.trust_score(*id), self.min_trust_score) {
                (Some(score), Some(min)) => score >= min,
                _ => true,
            })
            .collect();
        let Some(&first) = candidates.first() else {
            return Err(RoutingError::NoCapableServer(key.clone()));
        };

        let chosen = match self.strategy {
            RoutingStrategy::CapabilityMatch => first,
            RoutingStrategy::RoundRobin => {
                let cursor = self.cursors.entry(key.clone()).or_insert(0);
                let chosen = candidates[*cursor % candidates.len()];
                *cursor = cursor.wrapping_add(1);
                chosen
            }
            RoutingStrategy::LeastLoaded => candidates
                .iter()
                .copied()
                .min_by_key(|id| load(*id))
                .unwrap_or(first),
            RoutingStrategy::HighestTrust => {
                let mut best: Option<(ServerId, f64)> = None;
                for id in &candidates {
                    if let Some(score) = caps.trust_score(*id) {
                        if best.map_or(true, |(_, b)| score > b) {
                            best = Some((*id, score));
                        }
                    }
                }
                best.map_or(first, |(id, _)| id)
            }
        };
        tracing::debug!(route = %key, strategy = ?self.strategy, server = %chosen, "routed");
        Ok(chosen)
    }
}

/// Pick the agent for `task`: every required capability must be offered as a
/// tool or knowledge domain, and the trust floor must be met. Highest trust
/// wins; ties go to the earlier card.
pub fn select_agent<'a>(task: &TaskRequest, cards: &'a [AgentCard]) -> Option<&'a AgentCard> {
    let mut best: Option<&AgentCard> = None;
    for card in cards {
        let offers_all = task.requirements.capabilities.iter().all(|cap| {
            card.offers_tool(cap) || card.capabilities.knowledge_domains.iter().any(|d| d == cap)
        });
        let trusted = task
            .requirements
            .minimum_trust_score
            .map_or(true, |min| card.metadata.trust_score >= min);
        if !(offers_all && trusted) {
            continue;
        }
        if best.map_or(true, |b| card.metadata.trust_score > b.metadata.trust_score) {
            best = Some(card);
        }
    }
    best
}
