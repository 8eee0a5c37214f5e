use thiserror::Error;

/// Core error types for OctoFHIR resource handling
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid FHIR resource type: {0}")]
    InvalidResourceType(String),

    #[error("Invalid FHIR ID: {0}")]
    InvalidId(String),

    #[error("Invalid FHIR reference: {0}")]
    InvalidReference(String),

    #[error("Invalid resource data: {message}")]
    InvalidResource { message: String },

    #[error("Invalid bundle: {message}")]
    InvalidBundle { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    UuidError(#[from] uuid::Error),
}

impl CoreError {
    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(resource_type: impl Into<String>) -> Self {
        Self::InvalidResourceType(resource_type.into())
    }

    /// Create a new InvalidId error
    pub fn invalid_id(id: impl Into<String>) -> Self {
        Self::InvalidId(id.into())
    }

    /// Create a new InvalidReference error
    pub fn invalid_reference(reference: impl Into<String>) -> Self {
        Self::InvalidReference(reference.into())
    }

    /// Create a new InvalidResource error
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Create a new InvalidBundle error
    pub fn invalid_bundle(message: impl Into<String>) -> Self {
        Self::InvalidBundle {
            message: message.into(),
        }
    }

    /// Check if this error was caused by the input data rather than the system
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::UuidError(_))
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::invalid_resource_type("patient");
        assert_eq!(err.to_string(), "Invalid FHIR resource type: patient");
        assert!(err.is_input_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let core_err: CoreError = json_err.into();

        assert!(matches!(core_err, CoreError::JsonError(_)));
        assert!(core_err.is_input_error());
    }

    #[test]
    fn test_uuid_error_is_system() {
        let core_err: CoreError = uuid::Uuid::parse_str("not-a-uuid").unwrap_err().into();
        assert!(!core_err.is_input_error());
    }

    #[test]
    fn test_bundle_error_message() {
        let err = CoreError::invalid_bundle("entry 3 has no request");
        assert!(err.to_string().contains("entry 3 has no request"));
    }
}
