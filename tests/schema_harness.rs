use mcp_a2a_proxy::schema::{validate_json, SchemaValidationError};

const ERROR_OBJECT_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "type": "object",
  "required": ["code", "message"],
  "additionalProperties": false,
  "properties": {
    "code": { "type": "integer" },
    "message": { "type": "string", "minLength": 1 },
    "data": {}
  }
}"#;

#[test]
fn json_schema_harness_validates_instance() {
    let instance = r#"{
      "code": -32001,
      "message": "no available server provides tool 'search'",
      "data": { "kind": "tools", "name": "search" }
    }"#;

    validate_json(ERROR_OBJECT_SCHEMA, instance).expect("schema validation failed");
}

#[test]
fn json_schema_harness_reports_violations() {
    let instance = r#"{ "code": "busy", "message": "" }"#;

    match validate_json(ERROR_OBJECT_SCHEMA, instance) {
        Err(SchemaValidationError::ValidationFailed(errors)) => {
            assert!(!errors.is_empty());
            assert!(errors.len() <= 3);
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn json_schema_harness_rejects_unparseable_schema() {
    assert!(matches!(
        validate_json("{ not json", "{}"),
        Err(SchemaValidationError::SchemaParse(_))
    ));
}
