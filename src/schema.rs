//! JSON schema inference and union merging.
//!
//! Schemas are plain `serde_json::Value` documents in JSON Schema shape.
//! Inference is total for JSON-representable inputs; merging widens property
//! sets and narrows `required` sets so the merged schema validates every
//! sample it was built from.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w.+-]+@[\w.-]+\.\w+$").expect("valid email regex"))
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"))
}

fn datetime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").expect("valid datetime regex")
    })
}

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("valid uuid regex")
    })
}

/// Detect a string format (email, date, date-time, uri, uuid).
pub fn detect_format(s: &str) -> Option<&'static str> {
    if email_regex().is_match(s) {
        Some("email")
    } else if date_regex().is_match(s) {
        Some("date")
    } else if datetime_regex().is_match(s) {
        Some("date-time")
    } else if s.starts_with("http://") || s.starts_with("https://") {
        Some("uri")
    } else if uuid_regex().is_match(s) {
        Some("uuid")
    } else {
        None
    }
}

/// Infer a JSON schema from a JSON value. Total for any `Value`.
pub fn infer_schema(data: &Value) -> Value {
    match data {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                json!({"type": "integer"})
            } else {
                json!({"type": "number"})
            }
        }
        Value::String(s) => match detect_format(s) {
            Some(format) => json!({"type": "string", "format": format}),
            None => json!({"type": "string"}),
        },
        Value::Array(items) => match items.first() {
            Some(first) => {
                let mut merged = infer_schema(first);
                for item in items.iter().skip(1) {
                    merged = merge_schemas(&merged, &infer_schema(item));
                }
                json!({"type": "array", "items": merged})
            }
            None => json!({"type": "array", "items": {}}),
        },
        Value::Object(map) => {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for (key, value) in map {
                properties.insert(key.clone(), infer_schema(value));
                required.push(Value::String(key.clone()));
            }
            if required.is_empty() {
                json!({"type": "object", "properties": {}})
            } else {
                json!({"type": "object", "properties": properties, "required": required})
            }
        }
    }
}

/// Infer a schema from a raw response body. Empty or whitespace-only bodies
/// become an empty object schema; non-JSON bodies yield `None`.
pub fn infer_body_schema(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return Some(json!({"type": "object", "properties": {}}));
    }
    serde_json::from_str::<Value>(body)
        .ok()
        .map(|data| infer_schema(&data))
}

fn schema_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(Value::as_str)
}

/// Merge two schemas with the union strategy.
///
/// - same primitive type: keep one, preferring a detected string format
/// - two objects: property union, `required` intersection
/// - two arrays: recursive `items` merge
/// - different types: `{anyOf: [s1, s2]}`
/// - either side `null`: the other side, marked nullable
pub fn merge_schemas(schema1: &Value, schema2: &Value) -> Value {
    if schema1.get("anyOf").is_some() || schema2.get("anyOf").is_some() {
        return merge_any_of(schema1, schema2);
    }

    let type1 = schema_type(schema1);
    let type2 = schema_type(schema2);

    if type1 == type2 && type1.is_some() {
        return match type1 {
            Some("object") => merge_object_schemas(schema1, schema2),
            Some("array") => merge_array_schemas(schema1, schema2),
            _ => merge_primitive_schemas(schema1, schema2),
        };
    }

    // A null sample must never erase an observed type
    if type1 == Some("null") {
        return mark_nullable(schema2.clone());
    }
    if type2 == Some("null") {
        return mark_nullable(schema1.clone());
    }

    if type1.is_some() && type2.is_some() {
        return json!({"anyOf": [schema1.clone(), schema2.clone()]});
    }

    // One side is typeless (empty array items, unknown branch): keep the typed side
    if type1.is_some() {
        schema1.clone()
    } else {
        schema2.clone()
    }
}

fn any_of_branches(schema: &Value) -> Vec<Value> {
    match schema.get("anyOf").and_then(Value::as_array) {
        Some(branches) => branches.clone(),
        None => vec![schema.clone()],
    }
}

fn merge_any_of(schema1: &Value, schema2: &Value) -> Value {
    // Fold every branch of the right side into the left side's branch list,
    // merging into a same-typed branch when one exists.
    let mut branches = any_of_branches(schema1);
    for incoming in any_of_branches(schema2) {
        let incoming_type = schema_type(&incoming).map(String::from);
        let slot = branches
            .iter()
            .position(|b| schema_type(b).map(String::from) == incoming_type);
        match slot {
            Some(idx) if incoming_type.is_some() => {
                branches[idx] = merge_schemas(&branches[idx].clone(), &incoming);
            }
            _ => branches.push(incoming),
        }
    }

    if branches.len() == 1 {
        branches.remove(0)
    } else {
        json!({"anyOf": branches})
    }
}

fn merge_primitive_schemas(schema1: &Value, schema2: &Value) -> Value {
    // Preserve the stricter format when only one side detected it
    if schema1.get("format").is_some() {
        schema1.clone()
    } else if schema2.get("format").is_some() {
        schema2.clone()
    } else {
        schema1.clone()
    }
}

fn merge_object_schemas(schema1: &Value, schema2: &Value) -> Value {
    let empty = Map::new();
    let props1 = schema1
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let props2 = schema2
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut merged_props = props1.clone();
    for (key, value) in props2 {
        match merged_props.get(key) {
            Some(existing) => {
                let merged = merge_schemas(existing, value);
                merged_props.insert(key.clone(), merged);
            }
            None => {
                merged_props.insert(key.clone(), value.clone());
            }
        }
    }

    let required1 = required_set(schema1);
    let required2 = required_set(schema2);
    let mut merged_required: Vec<String> = required1
        .iter()
        .filter(|k| required2.contains(*k))
        .cloned()
        .collect();
    merged_required.sort();

    let mut result = Map::new();
    result.insert("type".to_string(), Value::String("object".to_string()));
    result.insert("properties".to_string(), Value::Object(merged_props));
    if !merged_required.is_empty() {
        result.insert(
            "required".to_string(),
            Value::Array(merged_required.into_iter().map(Value::String).collect()),
        );
    }
    Value::Object(result)
}

fn merge_array_schemas(schema1: &Value, schema2: &Value) -> Value {
    let items1 = schema1.get("items").cloned().unwrap_or(json!({}));
    let items2 = schema2.get("items").cloned().unwrap_or(json!({}));
    json!({"type": "array", "items": merge_schemas(&items1, &items2)})
}

fn mark_nullable(mut schema: Value) -> Value {
    if let Some(map) = schema.as_object_mut() {
        map.insert("nullable".to_string(), Value::Bool(true));
    }
    schema
}

fn required_set(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Check whether a value conforms to a schema produced by this module.
pub fn validates(schema: &Value, value: &Value) -> bool {
    if let Some(branches) = schema.get("anyOf").and_then(Value::as_array) {
        return branches.iter().any(|branch| validates(branch, value));
    }

    if value.is_null() && schema.get("nullable") == Some(&Value::Bool(true)) {
        return true;
    }

    match schema_type(schema) {
        Some("null") => value.is_null(),
        Some("boolean") => value.is_boolean(),
        Some("integer") => value.as_i64().is_some() || value.as_u64().is_some(),
        Some("number") => value.is_number(),
        Some("string") => value.is_string(),
        Some("array") => match value.as_array() {
            Some(items) => {
                let item_schema = schema.get("items").cloned().unwrap_or(json!({}));
                if item_schema.as_object().map(|m| m.is_empty()).unwrap_or(false) {
                    return true;
                }
                items.iter().all(|item| validates(&item_schema, item))
            }
            None => false,
        },
        Some("object") => match value.as_object() {
            Some(map) => {
                let empty = Map::new();
                let props = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                for key in required_set(schema) {
                    if !map.contains_key(&key) {
                        return false;
                    }
                }
                map.iter().all(|(key, val)| match props.get(key) {
                    Some(prop_schema) => validates(prop_schema, val),
                    None => true,
                })
            }
            None => false,
        },
        // Typeless schema imposes no constraint
        _ => true,
    }
}

/// Maintains one merged schema per endpoint pattern, with observation counts.
#[derive(Debug, Default)]
pub struct SchemaMerger {
    schemas: HashMap<String, Value>,
    observation_counts: HashMap<String, u64>,
}

impl SchemaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a JSON sample into the pattern's schema and return the result.
    pub fn merge(&mut self, pattern: &str, data: &Value) -> Value {
        *self.observation_counts.entry(pattern.to_string()).or_insert(0) += 1;

        let new_schema = infer_schema(data);
        let merged = match self.schemas.get(pattern) {
            Some(existing) => merge_schemas(existing, &new_schema),
            None => new_schema,
        };
        self.schemas.insert(pattern.to_string(), merged.clone());
        merged
    }

    /// Merge a raw body string. Non-JSON bodies leave the schema untouched.
    pub fn merge_body(&mut self, pattern: &str, body: &str) -> Option<Value> {
        if body.trim().is_empty() {
            let empty = json!({});
            return Some(self.merge(pattern, &empty));
        }
        let data: Value = serde_json::from_str(body).ok()?;
        Some(self.merge(pattern, &data))
    }

    /// Get the current schema for a pattern.
    pub fn schema(&self, pattern: &str) -> Option<&Value> {
        self.schemas.get(pattern)
    }

    /// All merged schemas.
    pub fn all_schemas(&self) -> &HashMap<String, Value> {
        &self.schemas
    }

    /// Observation count for a pattern.
    pub fn observation_count(&self, pattern: &str) -> u64 {
        self.observation_counts.get(pattern).copied().unwrap_or(0)
    }
}
