use std::collections::HashMap;

use async_trait::async_trait;
use octofhir_core::{generate_id, resource_id, resource_type};
use octofhir_storage::{
    FhirStorage, HistoryEntry, HistoryMethod, HistoryParams, HistoryResult, SearchParams,
    SearchResult, StorageError, StoredResource,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::RwLock;

use crate::query;

pub type StorageKey = String; // Format: "ResourceType/id"

pub(crate) fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// In-memory FHIR storage backend.
///
/// Each key maps to the full version list of a resource, oldest first. The
/// last entry is the current version; a trailing `Delete` entry marks a
/// logically deleted resource.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: RwLock<HashMap<StorageKey, Vec<HistoryEntry>>>,
}

impl InMemoryStorage {
    /// Creates a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources whose current version is not deleted.
    pub async fn live_count(&self) -> usize {
        let guard = self.data.read().await;
        guard
            .values()
            .filter(|versions| versions.last().is_some_and(|v| !v.is_delete()))
            .count()
    }
}

/// Extracts resourceType from a JSON Value.
fn extract_resource_type(resource: &Value) -> Result<String, StorageError> {
    resource_type(resource)
        .map(String::from)
        .ok_or_else(|| StorageError::invalid_resource("Missing resourceType field"))
}

/// Sets `id`, `meta.versionId` and `meta.lastUpdated`, keeping other meta fields.
fn stamp(resource: &Value, id: &str, version_id: &str, now: OffsetDateTime) -> Value {
    let mut stamped = resource.clone();
    if let Some(obj) = stamped.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.to_string()));
        let meta = obj.entry("meta").or_insert_with(|| json!({}));
        if !meta.is_object() {
            *meta = json!({});
        }
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), json!(version_id));
            meta.insert(
                "lastUpdated".to_string(),
                json!(now.format(&Rfc3339).unwrap_or_default()),
            );
        }
    }
    stamped
}

fn next_version(versions: &[HistoryEntry]) -> String {
    (versions.len() + 1).to_string()
}

fn gone(entry: &HistoryEntry) -> StorageError {
    StorageError::gone(
        &entry.resource.resource_type,
        &entry.resource.id,
        &entry.resource.version_id,
    )
}

#[async_trait]
impl FhirStorage for InMemoryStorage {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = generate_id();
        let key = make_storage_key(&resource_type, &id);
        let now = OffsetDateTime::now_utc();

        let mut guard = self.data.write().await;
        if guard.contains_key(&key) {
            return Err(StorageError::already_exists(&resource_type, &id));
        }

        let version_id = "1";
        let mut stored = StoredResource::new(
            id.clone(),
            version_id,
            resource_type,
            stamp(resource, &id, version_id, now),
        );
        stored.last_updated = now;
        stored.created_at = now;

        guard.insert(key, vec![HistoryEntry::new(stored.clone(), HistoryMethod::Create)]);
        Ok(stored)
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(resource_type, id);
        let guard = self.data.read().await;
        match guard.get(&key).and_then(|versions| versions.last()) {
            Some(current) if current.is_delete() => Err(gone(current)),
            Some(current) => Ok(Some(current.resource.clone())),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = resource_id(resource)
            .map(String::from)
            .ok_or_else(|| StorageError::invalid_resource("Missing id field for update"))?;
        let key = make_storage_key(&resource_type, &id);
        let now = OffsetDateTime::now_utc();

        let mut guard = self.data.write().await;
        let versions = guard.entry(key).or_default();

        if let Some(expected) = if_match {
            let Some(current) = versions.last() else {
                return Err(StorageError::not_found(&resource_type, &id));
            };
            if current.resource.version_id != expected {
                return Err(StorageError::version_conflict(
                    expected,
                    &current.resource.version_id,
                ));
            }
        }

        let version_id = next_version(versions);
        let content = stamp(resource, &id, &version_id, now);
        let (stored, method) = match versions.first() {
            Some(first) => (
                first.resource.new_version(version_id, content),
                HistoryMethod::Update,
            ),
            None => (
                StoredResource::new(id.clone(), version_id, resource_type, content),
                HistoryMethod::Create,
            ),
        };

        versions.push(HistoryEntry::new(stored.clone(), method));
        tracing::trace!(key = %stored.versioned_reference(), %method, "stored resource version");
        Ok(stored)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let key = make_storage_key(resource_type, id);
        let mut guard = self.data.write().await;
        let versions = guard
            .get_mut(&key)
            .filter(|versions| !versions.is_empty())
            .ok_or_else(|| StorageError::not_found(resource_type, id))?;

        let Some(current) = versions.last() else {
            return Err(StorageError::not_found(resource_type, id));
        };
        if current.is_delete() {
            return Ok(());
        }

        let version_id = next_version(versions);
        let marker = current.resource.new_version(
            version_id,
            json!({"resourceType": resource_type, "id": id}),
        );
        versions.push(HistoryEntry::new(marker, HistoryMethod::Delete));
        Ok(())
    }

    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(resource_type, id);
        let guard = self.data.read().await;
        let found = guard
            .get(&key)
            .and_then(|versions| versions.iter().find(|v| v.resource.version_id == version));
        match found {
            Some(entry) if entry.is_delete() => Err(gone(entry)),
            Some(entry) => Ok(Some(entry.resource.clone())),
            None => Ok(None),
        }
    }

    async fn history(
        &self,
        resource_type: &str,
        id: Option<&str>,
        params: &HistoryParams,
    ) -> Result<HistoryResult, StorageError> {
        let guard = self.data.read().await;
        let mut entries: Vec<HistoryEntry> = match id {
            Some(id) => guard
                .get(&make_storage_key(resource_type, id))
                .cloned()
                .unwrap_or_default(),
            None => {
                let prefix = format!("{resource_type}/");
                guard
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .flat_map(|(_, versions)| versions.iter().cloned())
                    .collect()
            }
        };
        drop(guard);

        if let Some(since) = params.since {
            entries.retain(|e| e.resource.last_updated >= since);
        }
        // Newest first; the version number breaks timestamp ties within one resource.
        entries.sort_by(|a, b| {
            b.resource.last_updated.cmp(&a.resource.last_updated).then_with(|| {
                let va = a.resource.version_id.parse::<u64>().unwrap_or(0);
                let vb = b.resource.version_id.parse::<u64>().unwrap_or(0);
                vb.cmp(&va)
            })
        });

        let total = entries.len() as u32;
        if let Some(count) = params.count {
            entries.truncate(count as usize);
        }
        Ok(HistoryResult {
            entries,
            total: Some(total),
        })
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError> {
        query::check_supported(params)?;

        let prefix = format!("{resource_type}/");
        let guard = self.data.read().await;
        let mut matching: Vec<StoredResource> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(_, versions)| versions.last())
            .filter(|current| !current.is_delete())
            .filter(|current| query::matches(&current.resource.resource, params))
            .map(|current| current.resource.clone())
            .collect();
        drop(guard);

        matching.sort_by(|a, b| a.id.cmp(&b.id));
        let total = matching.len();
        let offset = params.offset.unwrap_or(0) as usize;
        let count = params.count.map(|c| c as usize).unwrap_or(total);
        let entries: Vec<StoredResource> = matching.into_iter().skip(offset).take(count).collect();
        let has_more = offset + entries.len() < total;

        Ok(SearchResult {
            entries,
            total: Some(total as u32),
            has_more,
        })
    }

    async fn erase(&self, resource_type: &str, id: &str) -> Result<usize, StorageError> {
        let key = make_storage_key(resource_type, id);
        let removed = self
            .data
            .write()
            .await
            .remove(&key)
            .map(|versions| versions.len())
            .unwrap_or(0);
        if removed > 0 {
            tracing::debug!(resource_type, id, versions = removed, "erased resource");
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
