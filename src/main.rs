use mcp_a2a_proxy::config::ProxyConfig;
use mcp_a2a_proxy::server::ProxyServer;

/// Set to `1` or `true` for debug logging regardless of `RUST_LOG`.
const ENV_VERBOSE: &str = "MCP_PROXY_VERBOSE";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let verbose = std::env::args().any(|a| a == "--verbose" || a == "-v")
        || std::env::var(ENV_VERBOSE).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    init_tracing(verbose);

    let config = match ProxyConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("mcp-a2a-proxy: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let server = ProxyServer::new(config);
    if let Err(e) = server.run().await {
        eprintln!("mcp-a2a-proxy: fatal error: {e}");
        std::process::exit(1);
    }
}

/// Log to stderr; stdout carries the protocol.
///
/// `verbose` forces `debug`, otherwise `RUST_LOG` decides (default `info`).
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
