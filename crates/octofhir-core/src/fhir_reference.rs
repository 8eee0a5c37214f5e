//! FHIR Reference parsing utilities.
//!
//! References found in resources loaded from a bucket come in a few shapes:
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#contained-id` (only meaningful inside the parent resource)
//! - Bundle-local: `urn:uuid:xxx`, `urn:oid:xxx` or `resource:0` (only
//!   meaningful inside the bundle that declares them)
//!
//! # Example
//!
//! ```
//! use octofhir_core::fhir_reference::{is_local_identifier, parse_reference};
//!
//! let reference = parse_reference("Patient/123/_history/2").unwrap();
//! assert_eq!(reference.resource_type, "Patient");
//! assert_eq!(reference.id, "123");
//! assert_eq!(reference.version.as_deref(), Some("2"));
//!
//! assert!(is_local_identifier("urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a"));
//! assert!(!is_local_identifier("Patient/123"));
//! ```

use std::fmt;

/// Prefixes marking a bundle-local identifier.
pub const LOCAL_IDENTIFIER_PREFIXES: [&str; 2] = ["urn:", "resource:"];

/// A successfully parsed external FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The logical id
    pub id: String,
    /// Optional version ID from `_history` suffix
    pub version: Option<String>,
}

impl FhirReference {
    /// Creates a new FhirReference.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Creates a new FhirReference with a version.
    pub fn with_version(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: Some(version.into()),
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the reference with version if present (Type/id/_history/version).
    pub fn to_versioned(&self) -> String {
        match &self.version {
            Some(v) => format!("{}/{}/_history/{}", self.resource_type, self.id, v),
            None => self.to_relative(),
        }
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_versioned())
    }
}

/// Represents a reference that cannot be resolved outside its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A bundle-local identifier (`urn:...` or `resource:...`)
    Local(String),
    /// An absolute URL
    External(String),
    /// A malformed or invalid reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Local(id) => write!(f, "bundle-local identifier: {id}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Returns `true` when `value` is a bundle-local identifier.
pub fn is_local_identifier(value: &str) -> bool {
    LOCAL_IDENTIFIER_PREFIXES
        .iter()
        .any(|prefix| value.starts_with(prefix))
}

/// Parse a relative FHIR reference string into its components.
///
/// Absolute URLs are reported as external.
pub fn parse_reference(reference: &str) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "empty reference".to_string(),
        ));
    }

    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }

    if is_local_identifier(reference) {
        return Err(UnresolvableReference::Local(reference.to_string()));
    }

    if reference.contains("://") {
        return Err(UnresolvableReference::External(reference.to_string()));
    }

    let parts: Vec<&str> = reference.split('/').collect();
    if parts.len() < 2 {
        return Err(UnresolvableReference::Invalid(format!(
            "reference must contain at least Type/id: {reference}"
        )));
    }

    let resource_type = parts[0];
    let id = parts[1];

    if !crate::resource::is_valid_resource_type_name(resource_type) {
        return Err(UnresolvableReference::Invalid(format!(
            "invalid resource type: {resource_type}"
        )));
    }
    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "resource id cannot be empty".to_string(),
        ));
    }

    let version = match parts.as_slice() {
        [_, _, "_history", v, ..] if !v.is_empty() => Some((*v).to_string()),
        _ => None,
    };

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_relative_reference() {
        let r = parse_reference("Patient/123").unwrap();
        assert_eq!(r.resource_type, "Patient");
        assert_eq!(r.id, "123");
        assert_eq!(r.version, None);
    }

    #[test]
    fn test_versioned_reference() {
        let r = parse_reference("Patient/123/_history/2").unwrap();
        assert_eq!(r.version, Some("2".to_string()));
        assert_eq!(r.to_string(), "Patient/123/_history/2");
    }

    #[test]
    fn test_absolute_url_is_external() {
        assert!(matches!(
            parse_reference("http://other-server.com/fhir/Patient/123"),
            Err(UnresolvableReference::External(url)) if url.ends_with("Patient/123")
        ));
    }

    #[test]
    fn test_contained_reference() {
        let result = parse_reference("#contained-id");
        assert!(
            matches!(result, Err(UnresolvableReference::Contained(id)) if id == "contained-id")
        );
    }

    #[test]
    fn test_local_identifiers() {
        for local in [
            "urn:uuid:550e8400-e29b-41d4-a716-446655440000",
            "urn:oid:2.16.840.1.113883.4.642.3.1",
            "resource:0",
        ] {
            assert!(is_local_identifier(local));
            assert!(matches!(
                parse_reference(local),
                Err(UnresolvableReference::Local(_))
            ));
        }
        assert!(!is_local_identifier("Patient/urn:1"));
    }

    #[test]
    fn test_invalid_references() {
        assert!(matches!(
            parse_reference("patient/123"),
            Err(UnresolvableReference::Invalid(_))
        ));
        assert!(matches!(
            parse_reference("Patient/"),
            Err(UnresolvableReference::Invalid(_))
        ));
        assert!(matches!(
            parse_reference("Patient123"),
            Err(UnresolvableReference::Invalid(_))
        ));
        assert!(matches!(
            parse_reference("  "),
            Err(UnresolvableReference::Invalid(_))
        ));
    }
}
