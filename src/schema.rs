use jsonschema::validator_for;
use serde_json::Value;

/// At most this many violations are reported back to the caller.
const MAX_REPORTED_ERRORS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SchemaValidationError {
    #[error("Schema parse error: {0}")]
    SchemaParse(#[from] serde_json::Error),
    #[error("Schema compile error: {0}")]
    SchemaCompile(String),
    #[error("Instance validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
}

/// Validate a JSON instance against a JSON Schema (draft 2020-12).
/// Returns Ok(()) if valid, Err otherwise.
pub fn validate_json(schema_str: &str, instance_str: &str) -> Result<(), SchemaValidationError> {
    let schema_json: Value = serde_json::from_str(schema_str)?;
    let instance_json: Value = serde_json::from_str(instance_str)?;
    validate_value(&schema_json, &instance_json)
}

/// Same as [`validate_json`] over already-parsed values.
///
/// Used to check `tools/call` arguments against the provider's `inputSchema`
/// before anything is forwarded.
pub fn validate_value(schema: &Value, instance: &Value) -> Result<(), SchemaValidationError> {
    let validator =
        validator_for(schema).map_err(|e| SchemaValidationError::SchemaCompile(e.to_string()))?;

    if validator.is_valid(instance) {
        return Ok(());
    }
    let errors = validator
        .iter_errors(instance)
        .take(MAX_REPORTED_ERRORS)
        .map(|e| e.to_string())
        .collect();
    Err(SchemaValidationError::ValidationFailed(errors))
}
