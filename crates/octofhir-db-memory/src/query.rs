//! Search parameter matching for the in-memory backend.
//!
//! Supported parameters:
//! - `_id`: logical id equality
//! - any other name: equality against the top-level element of that name,
//!   where strings, numbers and booleans compare by their text and reference
//!   elements (`{"reference": "..."}`) compare by their reference string.
//!   Arrays match when any element matches.

use octofhir_storage::{SearchParams, StorageError};
use serde_json::Value;

/// Checks that every parameter in `params` is supported.
pub fn check_supported(params: &SearchParams) -> Result<(), StorageError> {
    for name in params.parameters.keys() {
        if name.starts_with('_') && name != "_id" {
            return Err(StorageError::invalid_resource(format!(
                "Unsupported search parameter: {name}"
            )));
        }
    }
    Ok(())
}

/// Returns `true` when `resource` satisfies every parameter in `params`.
pub fn matches(resource: &Value, params: &SearchParams) -> bool {
    params.parameters.iter().all(|(name, values)| {
        values
            .iter()
            .any(|expected| matches_param(resource, name, expected))
    })
}

fn matches_param(resource: &Value, name: &str, expected: &str) -> bool {
    if name == "_id" {
        return resource.get("id").and_then(Value::as_str) == Some(expected);
    }
    resource
        .get(name)
        .map(|element| element_matches(element, expected))
        .unwrap_or(false)
}

fn element_matches(element: &Value, expected: &str) -> bool {
    match element {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Array(items) => items.iter().any(|item| element_matches(item, expected)),
        Value::Object(map) => map
            .get("reference")
            .and_then(Value::as_str)
            .map(|r| r == expected)
            .unwrap_or(false),
        Value::Null => false,
    }
}
