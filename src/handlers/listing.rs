use serde_json::{Map, Value};

use crate::negotiator::AggregatedCapabilities;
use crate::protocol::{JsonRpcError, ListKind, PaginatedParams};

/// One page of a merged `*/list` result.
///
/// Cursors are the decimal offset of the next entry.
pub fn handle(
    kind: ListKind,
    params: &PaginatedParams,
    caps: &AggregatedCapabilities,
    page_size: usize,
) -> Result<Value, JsonRpcError> {
    let entries = caps.list(kind);
    let start = match params.cursor.as_deref() {
        None => 0,
        Some(cursor) => cursor
            .parse::<usize>()
            .ok()
            .filter(|n| *n <= entries.len())
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Invalid cursor: {cursor}")))?,
    };
    let end = start.saturating_add(page_size).min(entries.len());

    let mut result = Map::new();
    result.insert(
        kind.result_field().into(),
        Value::Array(entries[start..end].to_vec()),
    );
    if end < entries.len() {
        result.insert("nextCursor".into(), Value::String(end.to_string()));
    }
    Ok(Value::Object(result))
}
