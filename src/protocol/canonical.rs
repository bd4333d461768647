//! Deterministic canonicalization of intent parameters
//!
//! Goal keys dedupe on the canonical form of `(goal_type, intent_params)`,
//! so serialization must be stable: object keys recursively sorted, array
//! order preserved, and unserializable inputs collapsing to `None` instead
//! of producing an unstable key.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::task::TaskStep;

/// Serialize a JSON value with recursively sorted object keys
pub fn canonicalize_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string serialization cannot fail
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(entry) = map.get(*key) {
                    write_canonical(entry, out);
                }
            }
            out.push('}');
        }
    }
}

/// Canonicalize arbitrary intent params; `None` when the input does not
/// serialize (non-finite numbers, non-string map keys) or collapses to null
pub fn canonicalize_intent_params<T: Serialize>(params: &T) -> Option<String> {
    let value = serde_json::to_value(params).ok()?;
    if value.is_null() {
        return None;
    }
    Some(canonicalize_value(&value))
}

/// Dedup identity of a goal binding
pub fn goal_key(goal_type: &str, intent_params: &Value) -> String {
    match canonicalize_intent_params(intent_params) {
        Some(canonical) => format!("{}::{}", goal_type, canonical),
        None => format!("{}::null", goal_type),
    }
}

/// Hex-encoded SHA-256 of a string
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of a finalized step list; computed whether or not a splice
/// occurred so "absent" can never be read as "same as expansion"
pub fn steps_digest(steps: &[TaskStep]) -> String {
    let value = serde_json::to_value(steps).unwrap_or(Value::Null);
    sha256_hex(&canonicalize_value(&value))
}
