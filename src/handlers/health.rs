use serde_json::{json, Value};

/// `ping` result.
pub fn handle() -> Value {
    json!({})
}
