//! Data types used by the persistence contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// One version of a resource as held by a storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    /// The resource ID.
    pub id: String,
    /// The version ID of this specific version.
    pub version_id: String,
    /// The FHIR resource type (e.g., "Patient", "Observation").
    pub resource_type: String,
    /// The full resource content as JSON, with `id` and `meta` filled in.
    pub resource: Value,
    /// When this version was written.
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// When the first version of the resource was written.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl StoredResource {
    /// Creates a new `StoredResource` stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: now,
            created_at: now,
        }
    }

    /// Creates the next version of this resource with new content.
    #[must_use]
    pub fn new_version(&self, version_id: impl Into<String>, resource: Value) -> Self {
        Self {
            id: self.id.clone(),
            version_id: version_id.into(),
            resource_type: self.resource_type.clone(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
            created_at: self.created_at,
        }
    }

    /// Returns `Type/id/_history/version` for this version.
    #[must_use]
    pub fn versioned_reference(&self) -> String {
        format!(
            "{}/{}/_history/{}",
            self.resource_type, self.id, self.version_id
        )
    }
}

/// Result of a search operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matching resources for the requested page.
    pub entries: Vec<StoredResource>,
    /// Total count of matching resources.
    pub total: Option<u32>,
    /// Whether there are more results available beyond this page.
    pub has_more: bool,
}

impl SearchResult {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a history operation, newest version first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResult {
    pub entries: Vec<HistoryEntry>,
    pub total: Option<u32>,
}

impl HistoryResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single entry in a resource's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The resource at this point in history.
    pub resource: StoredResource,
    /// The operation that created this history entry.
    pub method: HistoryMethod,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(resource: StoredResource, method: HistoryMethod) -> Self {
        Self { resource, method }
    }

    /// Returns `true` when this version is a logical delete.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.method == HistoryMethod::Delete
    }
}

/// The operation that created a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMethod {
    /// Resource was created (POST).
    Create,
    /// Resource was updated (PUT).
    Update,
    /// Resource was deleted (DELETE).
    Delete,
}

impl std::fmt::Display for HistoryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "POST"),
            Self::Update => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Parameters for a history query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryParams {
    /// Only include versions written at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
    /// Maximum number of entries to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl HistoryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn since(mut self, since: OffsetDateTime) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// Parameters for a search query.
///
/// Keys are `_id` or the name of a top-level element; multiple values for the
/// same key are OR'ed, distinct keys are AND'ed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub parameters: BTreeMap<String, Vec<String>>,
    /// Maximum number of results to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Number of results to skip for pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl SearchParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a search parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_resource_serialization() {
        let resource = StoredResource::new(
            "123",
            "1",
            "Patient",
            serde_json::json!({"resourceType": "Patient", "id": "123"}),
        );

        let json = serde_json::to_string(&resource).expect("serialization failed");
        let deserialized: StoredResource =
            serde_json::from_str(&json).expect("deserialization failed");

        assert_eq!(resource.id, deserialized.id);
        assert_eq!(resource.version_id, deserialized.version_id);
        assert_eq!(resource.versioned_reference(), "Patient/123/_history/1");
    }

    #[test]
    fn test_new_version_keeps_created_at() {
        let v1 = StoredResource::new("1", "1", "Patient", serde_json::json!({}));
        let v2 = v1.new_version("2", serde_json::json!({"active": true}));
        assert_eq!(v2.created_at, v1.created_at);
        assert_eq!(v2.version_id, "2");
    }

    #[test]
    fn test_search_params_builder() {
        let params = SearchParams::new()
            .with_param("subject", "Patient/1")
            .with_param("subject", "Patient/2")
            .with_param("_id", "o1")
            .with_count(10)
            .with_offset(20);

        assert_eq!(params.parameters["subject"].len(), 2);
        assert_eq!(params.count, Some(10));
        assert_eq!(params.offset, Some(20));
        assert!(!params.is_empty());
    }

    #[test]
    fn test_history_method_display() {
        assert_eq!(HistoryMethod::Create.to_string(), "POST");
        assert_eq!(HistoryMethod::Update.to_string(), "PUT");
        assert_eq!(HistoryMethod::Delete.to_string(), "DELETE");
    }
}
