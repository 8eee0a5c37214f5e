//! Accessors for resources held as raw JSON.

use serde_json::Value;

/// Returns the `resourceType` of a JSON resource.
pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

/// Returns the logical `id` of a JSON resource.
pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// Returns `true` for a `Bundle` resource.
pub fn is_bundle(resource: &Value) -> bool {
    resource_type(resource) == Some("Bundle")
}

/// Validate if a string is a valid FHIR resource type name
pub fn is_valid_resource_type_name(name: &str) -> bool {
    // Must start with an uppercase letter and contain only letters
    name.chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphabetic())
}
