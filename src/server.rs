use std::sync::Arc;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::session::{Session, SessionSummary};
use crate::transport::StdioConnection;

/// Proxy that serves one MCP client on the process's stdin/stdout.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    audit: Arc<dyn AuditLogger>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            audit: Arc::new(TracingAuditLogger),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Run until the client disconnects or the process is interrupted.
    ///
    /// Ctrl-C drains the session: in-flight calls get the configured grace
    /// period before they are failed with a timeout.
    pub async fn run(&self) -> Result<SessionSummary, ProxyError> {
        let session = Session::new(self.config.clone(), Box::new(StdioConnection::process_stdio()))
            .with_audit(self.audit.clone());
        let shutdown = session.shutdown_handle();
        tracing::info!(
            session_id = session.id(),
            servers = self.config.servers.len(),
            agents = self.config.agents.len(),
            strategy = ?self.config.strategy,
            "proxy starting"
        );

        let signals = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received");
                    shutdown.shutdown().await;
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
            }
        });

        let result = session.run().await;
        signals.abort();

        if let Ok(summary) = &result {
            tracing::info!(
                reason = ?summary.reason,
                forwarded = summary.stats.requests_forwarded,
                relayed = summary.stats.responses_relayed,
                timed_out = summary.stats.timed_out,
                orphans = summary.stats.orphans,
                "proxy stopped"
            );
        }
        result
    }
}
