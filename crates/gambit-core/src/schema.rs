//! Schema contract — a JSON Schema document plus a compiled validator.
//!
//! The rest of the workspace only relies on `parse` and on structural
//! equality of the sorted-key JSON projection; validator internals never
//! leak past this module.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema failed to compile: {0}")]
    Compile(String),

    #[error("value failed validation: {0}")]
    Validation(String),
}

/// A usable schema: the raw document, its normalized projection, and a
/// compiled validator.
#[derive(Clone)]
pub struct Schema {
    raw: Value,
    projection: Value,
    validator: Arc<jsonschema::Validator>,
}

impl Schema {
    pub fn from_value(raw: Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(&raw).map_err(|e| SchemaError::Compile(e.to_string()))?;
        let projection = normalize_json_schema(&raw);
        Ok(Self {
            raw,
            projection,
            validator: Arc::new(validator),
        })
    }

    /// Validate `value` against the schema, returning it on success.
    pub fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        match self.validator.validate(value) {
            Ok(()) => Ok(value.clone()),
            Err(e) => Err(SchemaError::Validation(e.to_string())),
        }
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.validator.is_valid(value)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Sorted-key JSON projection used for structural comparison.
    pub fn projection(&self) -> &Value {
        &self.projection
    }

    /// Structural equality under sorted-key projection.
    pub fn structurally_eq(&self, other: &Schema) -> bool {
        self.projection == other.projection
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("projection", &self.projection)
            .finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_eq(other)
    }
}

/// Recursive sort of object keys; array order is preserved. Idempotent.
pub fn normalize_json_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), normalize_json_schema(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_json_schema).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_matching_value() {
        let schema = Schema::from_value(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }))
        .unwrap();
        let value = json!({"text": "hi"});
        assert_eq!(schema.parse(&value).unwrap(), value);
    }

    #[test]
    fn parse_rejects_wrong_type() {
        let schema = Schema::from_value(json!({"type": "object"})).unwrap();
        let err = schema.parse(&json!("not an object")).unwrap_err();
        assert!(matches!(err, SchemaError::Validation(_)));
    }

    #[test]
    fn normalize_sorts_keys_recursively() {
        let normalized = normalize_json_schema(&json!({
            "b": {"z": 1, "a": 2},
            "a": [ {"y": 1, "x": 2} ]
        }));
        assert_eq!(
            serde_json::to_string(&normalized).unwrap(),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let input = json!({"b": 1, "a": {"d": 2, "c": [3, 1, 2]}});
        let once = normalize_json_schema(&input);
        let twice = normalize_json_schema(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn structural_equality_ignores_key_order() {
        let left = Schema::from_value(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "number"}}
        }))
        .unwrap();
        let right = Schema::from_value(json!({
            "properties": {"b": {"type": "number"}, "a": {"type": "string"}},
            "type": "object"
        }))
        .unwrap();
        assert!(left.structurally_eq(&right));
    }

    #[test]
    fn structural_equality_preserves_array_order() {
        let left = Schema::from_value(json!({"enum": ["a", "b"]})).unwrap();
        let right = Schema::from_value(json!({"enum": ["b", "a"]})).unwrap();
        assert!(!left.structurally_eq(&right));
    }
}
