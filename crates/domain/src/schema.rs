//! Tool input-schema dialect: a closed subset of JSON Schema draft 2020-12.
//!
//! Supported keywords: `type` (object, string, number, integer, boolean,
//! array), `properties`, `required`, `enum`, `minimum`, `maximum`,
//! `exclusiveMinimum`, `exclusiveMaximum`, `minLength`, `maxLength`,
//! `pattern`, `items`, `minItems`, `maxItems`, `description`, `default`.
//! No `$ref`, no conditional schemas. The top level must be an object
//! schema.

use serde_json::Value;

use crate::error::{Error, Result};

const KNOWN_KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "enum",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "pattern",
    "items",
    "minItems",
    "maxItems",
    "description",
    "default",
];

const KNOWN_TYPES: &[&str] = &["object", "string", "number", "integer", "boolean", "array"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration-time schema check
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a schema at tool registration. The top level must declare
/// `type = "object"`; nested schemas may use any supported type.
pub fn check_schema(schema: &Value) -> Result<()> {
    let obj = schema
        .as_object()
        .ok_or_else(|| Error::Permanent("tool schema must be a JSON object".into()))?;
    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return Err(Error::Permanent(
            "tool schema top level must have type \"object\"".into(),
        ));
    }
    check_subschema(schema, "$")
}

fn check_subschema(schema: &Value, path: &str) -> Result<()> {
    let obj = schema
        .as_object()
        .ok_or_else(|| Error::Permanent(format!("{path}: schema must be an object")))?;

    for key in obj.keys() {
        if !KNOWN_KEYWORDS.contains(&key.as_str()) {
            return Err(Error::Permanent(format!(
                "{path}: unsupported schema keyword \"{key}\""
            )));
        }
    }

    if let Some(ty) = obj.get("type") {
        let ty = ty
            .as_str()
            .ok_or_else(|| Error::Permanent(format!("{path}: type must be a string")))?;
        if !KNOWN_TYPES.contains(&ty) {
            return Err(Error::Permanent(format!(
                "{path}: unsupported type \"{ty}\""
            )));
        }
    }

    if let Some(pattern) = obj.get("pattern") {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| Error::Permanent(format!("{path}: pattern must be a string")))?;
        regex::Regex::new(pattern)
            .map_err(|e| Error::Permanent(format!("{path}: invalid pattern: {e}")))?;
    }

    if let Some(props) = obj.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| Error::Permanent(format!("{path}: properties must be an object")))?;
        for (name, sub) in props {
            check_subschema(sub, &format!("{path}.{name}"))?;
        }
    }

    if let Some(items) = obj.get("items") {
        check_subschema(items, &format!("{path}[]"))?;
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a tool input against its schema. Returns every violation found,
/// path-tagged; empty result means the input is acceptable.
pub fn validate(schema: &Value, value: &Value) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    validate_at(schema, value, "$", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(obj) = schema.as_object() else {
        return;
    };

    if let Some(allowed) = obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value not in enum"));
            return;
        }
    }

    let ty = obj.get("type").and_then(Value::as_str);
    match ty {
        Some("object") => validate_object(obj, value, path, errors),
        Some("string") => validate_string(obj, value, path, errors),
        Some("number") => validate_number(obj, value, path, errors, false),
        Some("integer") => validate_number(obj, value, path, errors, true),
        Some("boolean") => {
            if !value.is_boolean() {
                errors.push(format!("{path}: expected boolean"));
            }
        }
        Some("array") => validate_array(obj, value, path, errors),
        _ => {}
    }
}

fn validate_object(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let Some(map) = value.as_object() else {
        errors.push(format!("{path}: expected object"));
        return;
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                errors.push(format!("{path}: missing required property \"{name}\""));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, sub) in props {
            if let Some(v) = map.get(name) {
                validate_at(sub, v, &format!("{path}.{name}"), errors);
            }
        }
    }
}

fn validate_string(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let Some(s) = value.as_str() else {
        errors.push(format!("{path}: expected string"));
        return;
    };
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            errors.push(format!("{path}: shorter than minLength {min}"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            errors.push(format!("{path}: longer than maxLength {max}"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        // Pattern validity was checked at registration; a bad pattern here
        // counts against the input rather than panicking.
        match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(s) => {}
            Ok(_) => errors.push(format!("{path}: does not match pattern")),
            Err(_) => errors.push(format!("{path}: unusable pattern in schema")),
        }
    }
}

fn validate_number(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<String>,
    integer: bool,
) {
    let Some(n) = value.as_f64() else {
        errors.push(format!("{path}: expected number"));
        return;
    };
    if integer && value.as_i64().is_none() && value.as_u64().is_none() {
        errors.push(format!("{path}: expected integer"));
        return;
    }
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            errors.push(format!("{path}: below minimum {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            errors.push(format!("{path}: above maximum {max}"));
        }
    }
    if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        if n <= min {
            errors.push(format!("{path}: not above exclusiveMinimum {min}"));
        }
    }
    if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        if n >= max {
            errors.push(format!("{path}: not below exclusiveMaximum {max}"));
        }
    }
}

fn validate_array(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let Some(items) = value.as_array() else {
        errors.push(format!("{path}: expected array"));
        return;
    };
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            errors.push(format!("{path}: fewer than minItems {min}"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            errors.push(format!("{path}: more than maxItems {max}"));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{i}]"), errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "description": "demo",
            "properties": {
                "name": {"type": "string", "minLength": 1, "maxLength": 8},
                "count": {"type": "integer", "minimum": 0, "maximum": 10},
                "ratio": {"type": "number", "exclusiveMinimum": 0.0, "exclusiveMaximum": 1.0},
                "mode": {"type": "string", "enum": ["fast", "slow"]},
                "tags": {
                    "type": "array",
                    "items": {"type": "string", "pattern": "^[a-z]+$"},
                    "minItems": 1,
                    "maxItems": 3
                }
            },
            "required": ["name"]
        })
    }

    #[test]
    fn accepts_valid_schema() {
        assert!(check_schema(&schema()).is_ok());
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(check_schema(&json!({"type": "string"})).is_err());
        assert!(check_schema(&json!("nope")).is_err());
    }

    #[test]
    fn rejects_unknown_keyword() {
        let s = json!({"type": "object", "$ref": "#/defs/x"});
        assert!(check_schema(&s).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let s = json!({"type": "object", "properties": {"x": {"type": "null"}}});
        assert!(check_schema(&s).is_err());
    }

    #[test]
    fn rejects_bad_pattern() {
        let s = json!({"type": "object", "properties": {"x": {"type": "string", "pattern": "("}}});
        assert!(check_schema(&s).is_err());
    }

    #[test]
    fn valid_input_passes() {
        let input = json!({
            "name": "abc",
            "count": 3,
            "ratio": 0.5,
            "mode": "fast",
            "tags": ["one", "two"]
        });
        assert!(validate(&schema(), &input).is_ok());
    }

    #[test]
    fn missing_required_fails() {
        let errs = validate(&schema(), &json!({})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("required")));
    }

    #[test]
    fn string_bounds_enforced() {
        let errs = validate(&schema(), &json!({"name": "way too long here"})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("maxLength")));
    }

    #[test]
    fn integer_rejects_float() {
        let errs = validate(&schema(), &json!({"name": "a", "count": 1.5})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("integer")));
    }

    #[test]
    fn exclusive_bounds() {
        let errs = validate(&schema(), &json!({"name": "a", "ratio": 1.0})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("exclusiveMaximum")));
        let errs = validate(&schema(), &json!({"name": "a", "ratio": 0.0})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("exclusiveMinimum")));
    }

    #[test]
    fn enum_membership() {
        let errs = validate(&schema(), &json!({"name": "a", "mode": "medium"})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("enum")));
    }

    #[test]
    fn array_items_and_bounds() {
        let errs = validate(&schema(), &json!({"name": "a", "tags": []})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("minItems")));
        let errs = validate(&schema(), &json!({"name": "a", "tags": ["UPPER"]})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("pattern")));
    }

    #[test]
    fn multiple_violations_reported() {
        let errs = validate(&schema(), &json!({"count": 99, "mode": "medium"})).unwrap_err();
        assert!(errs.len() >= 3, "expected several violations, got {errs:?}");
    }
}
