//! Action response normalization
//!
//! The remote endpoint answers with several generations of payload shape:
//! a transport envelope around a leaf result, a dispatcher-wrapped leaf, or
//! a bare legacy leaf. Normalization collapses all of them into one outcome
//! with hoisted diagnostics and a deterministic-vs-retryable classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized outcome of a remote action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_diagnostics: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_error_code: Option<String>,
}

impl NormalizedResponse {
    fn failure(error: String, failure_code: Option<String>) -> Self {
        Self {
            ok: false,
            error: Some(error),
            failure_code,
            data: Value::Null,
            tool_diagnostics: None,
            leaf_status: None,
            leaf_error_code: None,
        }
    }
}

/// Normalize an arbitrary endpoint payload
pub fn normalize_action_response(payload: &Value) -> NormalizedResponse {
    if is_empty_payload(payload) {
        return NormalizedResponse::failure("Empty response".to_string(), None);
    }

    // Outer transport failure
    if payload.get("success").and_then(Value::as_bool) == Some(false) {
        let error = extract_error(payload).unwrap_or_else(|| "Action failed".to_string());
        return NormalizedResponse::failure(error, extract_failure_code(payload));
    }

    let diagnostics = hoist_diagnostics(payload);

    // Locate the leaf payload: transport `result`, dispatcher `data.leafResult`,
    // or the payload itself when no wrapper is present.
    let leaf = payload
        .get("result")
        .filter(|value| !value.is_null())
        .or_else(|| {
            payload
                .get("data")
                .and_then(|data| data.get("leafResult"))
                .filter(|value| !value.is_null())
        });

    let transport_success = payload.get("success").and_then(Value::as_bool) == Some(true)
        || payload.get("status").and_then(Value::as_str) == Some("success");

    let leaf = match leaf {
        Some(leaf) => leaf,
        None if transport_success => {
            // Transport success with no leaf payload
            return NormalizedResponse {
                ok: true,
                error: None,
                failure_code: None,
                data: payload.get("data").cloned().unwrap_or(Value::Null),
                tool_diagnostics: diagnostics,
                leaf_status: None,
                leaf_error_code: None,
            };
        }
        None => payload,
    };

    let leaf_status = leaf
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string);
    let leaf_error_code = leaf
        .get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let explicit_success = leaf.get("success").and_then(Value::as_bool) == Some(true)
        || leaf_status.as_deref() == Some("success");
    let failed = leaf.get("success").and_then(Value::as_bool) == Some(false)
        || leaf_status.as_deref() == Some("failure")
        || (!leaf.get("error").map_or(true, Value::is_null) && !explicit_success);

    if failed {
        let error = extract_error(leaf).unwrap_or_else(|| "Action failed".to_string());
        let failure_code = extract_failure_code(leaf).or_else(|| extract_failure_code(payload));
        return NormalizedResponse {
            ok: false,
            error: Some(error),
            failure_code,
            data: leaf.clone(),
            tool_diagnostics: diagnostics,
            leaf_status,
            leaf_error_code,
        };
    }

    NormalizedResponse {
        ok: true,
        error: None,
        failure_code: None,
        data: leaf.clone(),
        tool_diagnostics: diagnostics,
        leaf_status,
        leaf_error_code,
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Error extraction order: `error` string, `error.detail`, `error.message`,
/// then top-level `message`
fn extract_error(obj: &Value) -> Option<String> {
    if let Some(error) = obj.get("error") {
        if let Some(text) = error.as_str() {
            return Some(text.to_string());
        }
        if let Some(detail) = error.get("detail").and_then(Value::as_str) {
            return Some(detail.to_string());
        }
        if let Some(message) = error.get("message").and_then(Value::as_str) {
            return Some(message.to_string());
        }
    }
    obj.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Failure-code extraction: `error.code`, then top-level `failureCode`
fn extract_failure_code(obj: &Value) -> Option<String> {
    obj.get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            obj.get("failureCode")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// Hoist `toolDiagnostics` from the recognized wrapper shapes, accepting
/// only objects that carry a non-null version tag
fn hoist_diagnostics(payload: &Value) -> Option<Value> {
    let candidates = [
        payload
            .get("data")
            .and_then(|data| data.get("leafResult"))
            .and_then(|leaf| leaf.get("result"))
            .and_then(|result| result.get("toolDiagnostics")),
        payload
            .get("result")
            .and_then(|result| result.get("toolDiagnostics")),
    ];
    for candidate in candidates.into_iter().flatten() {
        let versioned = candidate
            .get("version")
            .map(|version| !version.is_null())
            .unwrap_or(false);
        if versioned {
            return Some(candidate.clone());
        }
    }
    None
}

/// Terminal leaf failure codes; matched on the full code and its dot-suffix
const TERMINAL_CODES: &[&str] = &[
    "invalid_input",
    "tool_invalid",
    "missing_ingredient",
    "inventory_full",
    "unloaded_chunks",
    "unknown_recipe",
    "unknown_block",
    "unknown_item",
];

/// Classify a failure code as deterministic (retrying cannot help)
pub fn is_deterministic_failure(code: &str) -> bool {
    if code.starts_with("mapping_")
        || code.starts_with("contract_")
        || code.starts_with("postcondition_")
    {
        return true;
    }
    if TERMINAL_CODES.contains(&code) {
        return true;
    }
    if let Some(suffix) = code.rsplit('.').next() {
        if suffix != code && TERMINAL_CODES.contains(&suffix) {
            return true;
        }
    }
    false
}
