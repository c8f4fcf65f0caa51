use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::protocol::a2a::AgentCard;
use crate::protocol::{PROTOCOL_VERSIONS_COMPATIBLE, PROTOCOL_VERSION_LATEST};
use crate::router::RoutingStrategy;
use crate::transport::TransportConfig;

/// Default timeout for a forwarded request (30 seconds).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default bound on one initialize exchange (10 seconds).
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default grace period for in-flight calls when a session drains (5 seconds).
const DEFAULT_DRAIN_GRACE_MS: u64 = 5_000;

/// Default depth of each per-connection outbound queue.
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default number of entries per page in proxy-served `*/list` results.
const DEFAULT_PAGE_SIZE: usize = 100;

const ENV_CONFIG_PATH: &str = "MCP_PROXY_CONFIG";
const ENV_REQUEST_TIMEOUT_MS: &str = "MCP_PROXY_REQUEST_TIMEOUT_MS";
const ENV_STRATEGY: &str = "MCP_PROXY_STRATEGY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingEnv(&'static str),

    #[error("{name} must be {expected}")]
    InvalidEnv {
        name: &'static str,
        expected: &'static str,
    },

    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no downstream servers or agents configured")]
    NoDownstreams,

    #[error("downstream name must not be empty")]
    EmptyName,

    #[error("duplicate downstream name: '{0}'")]
    DuplicateName(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Proxy configuration. Passed explicitly to every session.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: Vec<DownstreamConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub handshake_retry: RetryPolicy,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Identity used as `from` on bridged A2A requests and as `serverInfo.name`.
    #[serde(default = "default_proxy_id")]
    pub proxy_id: String,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Agents below this trust score are never selected.
    #[serde(default)]
    pub min_trust_score: Option<f64>,
}

/// One downstream MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    pub name: String,
    pub transport: TransportConfig,
}

/// One A2A agent reachable over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub endpoint: Url,
    pub card: AgentCard,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_ms: u64,
    pub handshake_ms: u64,
    pub drain_grace_ms: u64,
    /// Per method class: exact method name, or `prefix/*`.
    pub per_method: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            per_method: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Timeout for a forwarded call: exact method, then `prefix/*`, then the default.
    pub fn request_timeout_for(&self, method: &str) -> Duration {
        let ms = self
            .per_method
            .get(method)
            .or_else(|| {
                let (prefix, _) = method.rsplit_once('/')?;
                self.per_method.get(&format!("{prefix}/*"))
            })
            .copied()
            .unwrap_or(self.request_ms);
        Duration::from_millis(ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Exponential backoff for handshake retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub version: String,
    pub compatible_versions: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION_LATEST.to_string(),
            compatible_versions: PROTOCOL_VERSIONS_COMPATIBLE
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl ProtocolConfig {
    pub fn accepts(&self, version: &str) -> bool {
        self.version == version || self.compatible_versions.iter().any(|v| v == version)
    }
}

fn default_proxy_id() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl ProxyConfig {
    /// Load configuration from environment.
    ///
    /// - `MCP_PROXY_CONFIG` (required): path to the JSON config file
    /// - `MCP_PROXY_REQUEST_TIMEOUT_MS` (optional): overrides `timeouts.request_ms`
    /// - `MCP_PROXY_STRATEGY` (optional): overrides `strategy`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ProxyConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = lookup(ENV_CONFIG_PATH).ok_or(ConfigError::MissingEnv(ENV_CONFIG_PATH))?;
        let mut config = Self::read_file(Path::new(&path))?;

        if let Some(val) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            config.timeouts.request_ms = val.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_REQUEST_TIMEOUT_MS,
                expected: "a positive integer",
            })?;
        }
        if let Some(val) = lookup(ENV_STRATEGY) {
            config.strategy = val.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_STRATEGY,
                expected: "one of capability_match, round_robin, least_loaded, highest_trust",
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() && self.agents.is_empty() {
            return Err(ConfigError::NoDownstreams);
        }

        let mut names = HashSet::new();
        let all_names = self
            .servers
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.agents.iter().map(|a| a.card.id.as_str()));
        for name in all_names {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
        }

        let retry = &self.handshake_retry;
        if retry.max_attempts == 0 {
            return Err(invalid("handshake_retry.max_attempts", "must be at least 1"));
        }
        if !(retry.backoff_multiplier >= 1.0) {
            return Err(invalid(
                "handshake_retry.backoff_multiplier",
                "must be at least 1.0",
            ));
        }

        let t = &self.timeouts;
        if t.request_ms == 0 || t.handshake_ms == 0 {
            return Err(invalid("timeouts", "request_ms and handshake_ms must be non-zero"));
        }
        if let Some((method, _)) = t.per_method.iter().find(|(_, ms)| **ms == 0) {
            return Err(invalid(
                "timeouts.per_method",
                format!("timeout for {method} must be non-zero"),
            ));
        }

        if self.protocol.version.trim().is_empty() {
            return Err(invalid("protocol.version", "must not be empty"));
        }
        if self.queue_depth == 0 || self.page_size == 0 {
            return Err(invalid("queue_depth/page_size", "must be non-zero"));
        }
        if let Some(min) = self.min_trust_score {
            if !(0.0..=1.0).contains(&min) {
                return Err(invalid("min_trust_score", "must be within 0.0..=1.0"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"{
        "servers": [
            {"name": "files", "transport": {"type": "stdio", "command": "files-mcp"}}
        ]
    }"#;

    #[test]
    fn defaults_apply() {
        let config = ProxyConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.strategy, RoutingStrategy::CapabilityMatch);
        assert_eq!(config.timeouts.request_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(config.handshake_retry.max_attempts, 3);
        assert_eq!(config.protocol.version, PROTOCOL_VERSION_LATEST);
        assert!(config.protocol.accepts("2024-11-05"));
        assert!(!config.protocol.accepts("1999-01-01"));
        assert_eq!(config.proxy_id, "mcp-a2a-proxy");
    }

    #[test]
    fn per_method_timeouts_fall_back_by_prefix() {
        let mut t = TimeoutConfig::default();
        t.per_method.insert("tools/call".into(), 60_000);
        t.per_method.insert("resources/*".into(), 2_000);

        assert_eq!(t.request_timeout_for("tools/call"), Duration::from_secs(60));
        assert_eq!(t.request_timeout_for("resources/read"), Duration::from_secs(2));
        assert_eq!(
            t.request_timeout_for("prompts/get"),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn validation_rejects_bad_configs() {
        assert!(matches!(
            ProxyConfig::from_json("{}"),
            Err(ConfigError::NoDownstreams)
        ));

        let dup = r#"{"servers": [
            {"name": "a", "transport": {"type": "stdio", "command": "x"}},
            {"name": "a", "transport": {"type": "stdio", "command": "y"}}
        ]}"#;
        assert!(matches!(
            ProxyConfig::from_json(dup),
            Err(ConfigError::DuplicateName(n)) if n == "a"
        ));

        let zero = r#"{"servers": [{"name": "a", "transport": {"type": "stdio", "command": "x"}}],
                       "handshake_retry": {"max_attempts": 0}}"#;
        assert!(matches!(
            ProxyConfig::from_json(zero),
            Err(ConfigError::InvalidValue { field: "handshake_retry.max_attempts", .. })
        ));

        assert!(matches!(
            ProxyConfig::from_json("{\"servers\": 3}"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_lookup_reads_file_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = ProxyConfig::from_lookup(|key| match key {
            "MCP_PROXY_CONFIG" => Some(path.clone()),
            "MCP_PROXY_REQUEST_TIMEOUT_MS" => Some("1500".into()),
            "MCP_PROXY_STRATEGY" => Some("least_loaded".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.timeouts.request_ms, 1500);
        assert_eq!(config.strategy, RoutingStrategy::LeastLoaded);

        let err = ProxyConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("MCP_PROXY_CONFIG")));

        let err = ProxyConfig::from_lookup(|key| match key {
            "MCP_PROXY_CONFIG" => Some(path.clone()),
            "MCP_PROXY_STRATEGY" => Some("random".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
