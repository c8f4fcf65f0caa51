use serde_json::Value;

use crate::config::ProxyConfig;
use crate::negotiator::AggregatedCapabilities;
use crate::protocol::{Implementation, InitializeParams, InitializeResult};

/// Answer the client's `initialize` with the merged view.
///
/// The client's requested protocol version is echoed when the proxy accepts
/// it; otherwise the proxy's own version is offered and the client decides.
pub fn handle(
    params: &InitializeParams,
    caps: &AggregatedCapabilities,
    config: &ProxyConfig,
) -> Value {
    let protocol_version = if config.protocol.accepts(&params.protocol_version) {
        params.protocol_version.clone()
    } else {
        tracing::warn!(
            requested = %params.protocol_version,
            offered = %config.protocol.version,
            "client requested an unsupported protocol version"
        );
        config.protocol.version.clone()
    };

    tracing::info!(
        client = %params.client_info.name,
        client_version = %params.client_info.version,
        protocol = %protocol_version,
        "client initialized"
    );

    let result = InitializeResult {
        protocol_version,
        capabilities: caps.mcp_capabilities(),
        server_info: Implementation {
            name: config.proxy_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    serde_json::to_value(result).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig::from_json(
            r#"{"servers": [{"name": "a", "transport": {"type": "stdio", "command": "a"}}],
                "proxy_id": "edge-proxy"}"#,
        )
        .unwrap()
    }

    fn params(version: &str) -> InitializeParams {
        serde_json::from_value(json!({
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": {"name": "client", "version": "0.1"}
        }))
        .unwrap()
    }

    #[test]
    fn echoes_compatible_version() {
        let result = handle(&params("2024-11-05"), &AggregatedCapabilities::default(), &config());
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "edge-proxy");
    }

    #[test]
    fn offers_own_version_otherwise() {
        let result = handle(&params("1999-01-01"), &AggregatedCapabilities::default(), &config());
        assert_eq!(result["protocolVersion"], crate::protocol::PROTOCOL_VERSION_LATEST);
    }
}
