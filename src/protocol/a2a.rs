//! Agent-to-agent (A2A) envelopes, agent cards and coordination primitives.
//!
//! These are boundary types: the proxy reads agent cards from configuration,
//! builds [`TaskRequest`]/[`A2ARequest`] values when bridging a tool call, and
//! decodes [`A2AResponse`] replies. Field names follow the A2A wire format
//! (`snake_case` fields, upper-case enum literals).

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Agent cards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub constraints: AgentConstraints,
    pub metadata: AgentMetadata,
}

impl AgentCard {
    pub fn offers_tool(&self, name: &str) -> bool {
        self.capabilities.tools.iter().any(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub knowledge_domains: Vec<String>,
    #[serde(default)]
    pub communication_patterns: Vec<CommunicationPattern>,
    #[serde(default)]
    pub supported_protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(default = "object_schema")]
    pub parameters: serde_json::Value,
    /// JSON Schema for the result.
    #[serde(default = "object_schema")]
    pub returns: serde_json::Value,
}

fn object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunicationPattern {
    RequestResponse,
    PublishSubscribe,
    Pipeline,
    Consensus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConstraints {
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_restrictions: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLevel {
    pub classification: Classification,
    pub encryption_required: bool,
    pub audit_level: AuditLevel,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self {
            classification: Classification::Internal,
            encryption_required: false,
            audit_level: AuditLevel::Basic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    None,
    Basic,
    Detailed,
    Comprehensive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_concurrent_tasks: u32,
    pub max_memory_mb: u32,
    pub max_cpu_percentage: u32,
    /// Milliseconds.
    pub max_execution_time: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            max_memory_mb: 1024,
            max_cpu_percentage: 100,
            max_execution_time: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub version: String,
    #[serde(default)]
    pub created_by: String,
    pub trust_score: f64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Task management
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub context: TaskContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Query,
    Analysis,
    Generation,
    Coordination,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_trust_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_preferences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_tasks: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Request / response envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2ARequest {
    pub id: String,
    pub from: String,
    pub to: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub context: RequestContext,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2AResponse {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<A2AError>,
    pub context: ResponseContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2AError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_suggestions: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationToken {
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Jwt,
    Bearer,
    Mtls,
    ApiKey,
}

/// Serializable part of the caller's security context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<ResourcePermission>,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermission {
    pub resource: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationToken>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseContext {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Milliseconds.
    #[serde(default)]
    pub processing_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_metadata: Option<AgentMetadata>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub id: String,
    pub proposal: serde_json::Value,
    pub voting_strategy: VotingStrategy,
    /// Milliseconds.
    pub timeout: u64,
    pub quorum: usize,
    pub participants: Vec<String>,
    pub initiator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotingStrategy {
    Majority,
    Unanimous,
    Weighted,
    Supermajority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub agent_id: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
    Passed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub request_id: String,
    pub status: ConsensusStatus,
    pub votes: Vec<ConsensusVote>,
    pub final_tally: VoteTally,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub approve: u32,
    pub reject: u32,
    pub abstain: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<f64>,
}

impl ConsensusRequest {
    /// Tally `votes` cast for this request.
    ///
    /// Only the first vote of each listed participant counts. Returns `None`
    /// while quorum is unmet and the voting window (`started_at + timeout`)
    /// is still open; once it closes without quorum the status is `TIMEOUT`.
    pub fn tally(
        &self,
        votes: &[ConsensusVote],
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ConsensusResult> {
        let participants: HashSet<&str> = self.participants.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let counted: Vec<ConsensusVote> = votes
            .iter()
            .filter(|v| participants.contains(v.agent_id.as_str()))
            .filter(|v| seen.insert(v.agent_id.clone()))
            .cloned()
            .collect();

        let mut tally = VoteTally::default();
        let (mut approve_w, mut reject_w, mut total_w) = (0.0_f64, 0.0_f64, 0.0_f64);
        for vote in &counted {
            let w = vote.weight.unwrap_or(1.0);
            total_w += w;
            match vote.decision {
                Decision::Approve => {
                    tally.approve += 1;
                    approve_w += w;
                }
                Decision::Reject => {
                    tally.reject += 1;
                    reject_w += w;
                }
                Decision::Abstain => tally.abstain += 1,
            }
        }
        if self.voting_strategy == VotingStrategy::Weighted {
            tally.total_weight = Some(total_w);
        }

        let window = ChronoDuration::milliseconds(i64::try_from(self.timeout).unwrap_or(i64::MAX));
        let expired = now >= started_at + window;

        let status = if counted.len() < self.quorum {
            if !expired {
                return None;
            }
            ConsensusStatus::Timeout
        } else {
            let (a, r) = (tally.approve, tally.reject);
            let passed = match self.voting_strategy {
                VotingStrategy::Majority => a > r,
                VotingStrategy::Unanimous => a > 0 && r == 0,
                VotingStrategy::Supermajority => a > 0 && a * 3 >= (a + r) * 2,
                VotingStrategy::Weighted => approve_w > reject_w,
            };
            if passed {
                ConsensusStatus::Passed
            } else {
                ConsensusStatus::Failed
            }
        };

        Some(ConsensusResult {
            request_id: self.id.clone(),
            status,
            votes: counted,
            final_tally: tally,
            execution_plan: None,
        })
    }
}
