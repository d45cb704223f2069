// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Declarative input validation for tool calls.
//!
//! Checks the parts of a JSON-Schema-shaped contract that matter for
//! dispatch safety: `required` members and primitive `type` tags, applied
//! recursively through nested objects.  This is also what the stop-reason
//! repair path uses to detect tool calls whose arguments were cut off by
//! `max_tokens`.

use serde_json::Value;

/// Validate `input` against `schema`.  Returns a human-readable description
/// of the first violation found.
pub fn validate(schema: &Value, input: &Value) -> Result<(), String> {
    validate_at(schema, input, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        check_type(expected, value, path)?;
    }

    if value.is_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for name in required.iter().filter_map(|n| n.as_str()) {
                if value.get(name).is_none() {
                    return Err(format!("{path}: missing required property '{name}'"));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (name, prop_schema) in props {
                if let Some(v) = value.get(name) {
                    validate_at(prop_schema, v, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            validate_at(items, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn check_type(expected: &str, value: &Value, path: &str) -> Result<(), String> {
    let ok = match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type tags are not enforced.
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "{path}: expected {expected}, got {}",
            type_name(value)
        ))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "count": { "type": "integer" },
                "tags": { "type": "array", "items": { "type": "string" } },
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_input_passes() {
        assert!(validate(&schema(), &json!({"path": "/tmp", "count": 3})).is_ok());
    }

    #[test]
    fn missing_required_property_fails() {
        let err = validate(&schema(), &json!({"count": 3})).unwrap_err();
        assert!(err.contains("path"));
        assert!(err.contains("required"));
    }

    #[test]
    fn wrong_primitive_type_fails() {
        let err = validate(&schema(), &json!({"path": 42})).unwrap_err();
        assert!(err.contains("expected string"));
    }

    #[test]
    fn non_object_input_fails_object_schema() {
        assert!(validate(&schema(), &json!("just a string")).is_err());
        assert!(validate(&schema(), &json!(null)).is_err());
    }

    #[test]
    fn empty_object_against_empty_schema_passes() {
        assert!(validate(&json!({"type": "object"}), &json!({})).is_ok());
    }

    #[test]
    fn array_items_validated() {
        let err = validate(&schema(), &json!({"path": "x", "tags": ["a", 1]})).unwrap_err();
        assert!(err.contains("[1]"));
    }

    #[test]
    fn nested_required_validated() {
        let s = json!({
            "type": "object",
            "properties": {
                "opts": {
                    "type": "object",
                    "required": ["mode"],
                }
            },
            "required": ["opts"]
        });
        assert!(validate(&s, &json!({"opts": {"mode": "fast"}})).is_ok());
        let err = validate(&s, &json!({"opts": {}})).unwrap_err();
        assert!(err.contains("mode"));
    }

    #[test]
    fn extra_properties_are_allowed() {
        assert!(validate(&schema(), &json!({"path": "x", "unknown": true})).is_ok());
    }
}
