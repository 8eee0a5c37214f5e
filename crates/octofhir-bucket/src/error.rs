use octofhir_core::CoreError;
use octofhir_storage::StorageError;
use thiserror::Error;

/// Errors raised by the bulk loader.
#[derive(Debug, Error)]
pub enum BucketError {
    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Data access error: {0}")]
    DataAccess(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid bundle name '{0}': expected a .json or .JSON suffix")]
    InvalidBundleName(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Invalid resource: {0}")]
    Core(#[from] CoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Loader is stopping")]
    Stopped,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BucketError {
    pub fn object_store(message: impl Into<String>) -> Self {
        Self::ObjectStore(message.into())
    }

    pub fn data_access(message: impl Into<String>) -> Self {
        Self::DataAccess(message.into())
    }

    pub fn invalid_bundle(message: impl Into<String>) -> Self {
        Self::InvalidBundle(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Infrastructure failures that are worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ObjectStore(_) | Self::DataAccess(_) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Failures caused by the content being loaded rather than the system.
    pub fn is_input_error(&self) -> bool {
        match self {
            Self::Json(_) | Self::InvalidBundleName(_) | Self::InvalidBundle(_) => true,
            Self::Core(e) => e.is_input_error(),
            Self::Storage(e) => matches!(e, StorageError::InvalidResource { .. }),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BucketError>;
