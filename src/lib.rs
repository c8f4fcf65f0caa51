//! Multiplexing MCP proxy.
//!
//! One MCP client talks to the proxy as if it were a single server. Behind it
//! the proxy negotiates with any number of MCP servers (stdio, HTTP,
//! WebSocket or SSE) and A2A agents, merges what they offer, routes each call
//! by name and rewrites request ids so responses find their way back.

pub mod audit;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handlers;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;
