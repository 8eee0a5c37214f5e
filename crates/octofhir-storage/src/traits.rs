//! The persistence contract every storage backend implements.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{HistoryParams, HistoryResult, SearchParams, SearchResult, StoredResource};

/// The main storage trait that all FHIR storage backends must implement.
///
/// Semantics shared by every backend:
/// - every successful write produces a new version with a new `version_id`;
/// - deletes are logical: a delete marker version is appended and the
///   resource reads as [`StorageError::Gone`] until it is written again;
/// - `erase` is the only operation that physically removes versions.
///
/// Implementations must be thread-safe (`Send + Sync`); independent calls may
/// run concurrently from different worker tasks.
///
/// # Example
///
/// ```ignore
/// use octofhir_storage::{FhirStorage, StorageError, StoredResource};
///
/// async fn get_patient(storage: &dyn FhirStorage, id: &str) -> Result<StoredResource, StorageError> {
///     storage
///         .read("Patient", id)
///         .await?
///         .ok_or_else(|| StorageError::not_found("Patient", id))
/// }
/// ```
#[async_trait]
pub trait FhirStorage: Send + Sync {
    // ==================== CRUD Operations ====================

    /// Creates a new resource.
    ///
    /// The resource must contain a `resourceType`. The backend assigns the
    /// logical id, ignoring any `id` in the payload.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the resource is malformed.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Reads the current version of a resource.
    ///
    /// Returns `None` if the resource never existed (or was erased).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Gone` if the current version is a delete marker.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Writes a new version of a resource identified by its `id`.
    ///
    /// When no resource with that id exists the update creates it, keeping the
    /// client-supplied id. When `if_match` is given it must equal the current
    /// version id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::VersionConflict` if `if_match` doesn't match.
    /// Returns `StorageError::InvalidResource` if `resourceType` or `id` is missing.
    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError>;

    /// Logically deletes a resource.
    ///
    /// Deleting an already deleted resource is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the resource does not exist.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError>;

    // ==================== Versioning ====================

    /// Reads a specific version of a resource.
    ///
    /// Returns `None` if the resource or version does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Gone` if that version is a delete marker.
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Returns the history of a resource (`id` given) or of a whole type,
    /// newest version first.
    async fn history(
        &self,
        resource_type: &str,
        id: Option<&str>,
        params: &HistoryParams,
    ) -> Result<HistoryResult, StorageError>;

    // ==================== Search ====================

    /// Searches current, non-deleted resources of a given type.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` for unsupported parameters.
    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError>;

    // ==================== Erase ====================

    /// Physically removes every version of a resource.
    ///
    /// Returns the number of versions removed (zero when nothing existed).
    async fn erase(&self, resource_type: &str, id: &str) -> Result<usize, StorageError>;

    // ==================== Metadata ====================

    /// Returns the name of this storage backend for logging/debugging.
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test that FhirStorage is object-safe
    fn _assert_storage_object_safe(_: &dyn FhirStorage) {}
}
