//! Methods the proxy answers itself from the aggregated capability view.

pub mod health;
pub mod initialize;
pub mod listing;

use crate::config::ProxyConfig;
use crate::negotiator::AggregatedCapabilities;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, MethodParams};

/// Answer `req` locally if it is one of the proxy-served methods.
///
/// Returns `None` for everything else; the session then routes it downstream.
pub fn dispatch(
    req: &JsonRpcRequest,
    params: &MethodParams,
    caps: &AggregatedCapabilities,
    config: &ProxyConfig,
) -> Option<JsonRpcResponse> {
    let id = Some(req.id.clone());
    match params {
        MethodParams::Initialize(init) => Some(JsonRpcResponse::success(
            id,
            initialize::handle(init, caps, config),
        )),

        MethodParams::Ping => Some(JsonRpcResponse::success(id, health::handle())),

        MethodParams::List(kind, page) => Some(
            match listing::handle(*kind, page, caps, config.page_size) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, e),
            },
        ),

        _ => None,
    }
}
