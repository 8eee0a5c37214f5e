//! Storage error types for the persistence contract.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested resource was not found.
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: String,
        /// The ID of the resource that was not found.
        id: String,
    },

    /// The resource exists but its current version is a logical delete.
    #[error("Resource deleted: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
        /// Version id of the delete marker.
        version_id: String,
    },

    /// `if_match` did not match the current version.
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// The expected version ID.
        expected: String,
        /// The actual version ID found.
        actual: String,
    },

    /// Attempted to create a resource that already exists.
    #[error("Resource already exists: {resource_type}/{id}")]
    AlreadyExists {
        resource_type: String,
        id: String,
    },

    /// The resource data is invalid.
    #[error("Invalid resource: {message}")]
    InvalidResource {
        /// Description of why the resource is invalid.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a new `Gone` error.
    #[must_use]
    pub fn gone(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: impl Into<String>,
    ) -> Self {
        Self::Gone {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: version_id.into(),
        }
    }

    /// Creates a new `VersionConflict` error.
    #[must_use]
    pub fn version_conflict(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::VersionConflict {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a new `InvalidResource` error.
    #[must_use]
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Returns `true` when retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            StorageError::not_found("Patient", "123").to_string(),
            "Resource not found: Patient/123"
        );
        assert_eq!(
            StorageError::gone("Patient", "123", "3").to_string(),
            "Resource deleted: Patient/123"
        );
        assert_eq!(
            StorageError::version_conflict("1", "2").to_string(),
            "Version conflict: expected 1, found 2"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(StorageError::not_found("Patient", "1").is_not_found());
        assert!(StorageError::gone("Patient", "1", "2").is_gone());
        assert!(StorageError::version_conflict("1", "2").is_version_conflict());
        assert!(StorageError::connection_error("refused").is_transient());
        assert!(!StorageError::internal("boom").is_transient());
    }
}
