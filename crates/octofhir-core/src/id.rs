//! Logical id generation and validation.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // FHIR id: 1-64 characters of [A-Za-z0-9-.]
    Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").expect("static id pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid ID '{0}': must be 1-64 characters of [A-Za-z0-9-.]")]
    Invalid(String),
}

/// Generates a random logical id (a v4 UUID).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a logical id whose string order roughly follows creation time.
///
/// Format: `{lowercase hex millis since epoch}-{uuid v4}`. The hex prefix keeps
/// ids generated close together adjacent in key-ordered indexes.
pub fn generate_ordered_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    ordered_id_at(millis.max(0) as u128)
}

fn ordered_id_at(millis: u128) -> String {
    format!("{millis:x}-{}", Uuid::new_v4())
}

/// Validates a logical id against the FHIR id datatype.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(IdError::Invalid(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_id_format() {
        let pattern = Regex::new(
            r"^[0-9a-f]+-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
        )
        .unwrap();
        for _ in 0..32 {
            let id = generate_ordered_id();
            assert!(pattern.is_match(&id), "unexpected id format: {id}");
            assert!(validate_id(&id).is_ok());
        }
    }

    #[test]
    fn test_ordered_id_prefix_tracks_time() {
        let earlier = ordered_id_at(0x18f_0000_0000);
        let later = ordered_id_at(0x18f_0000_0001);
        assert!(earlier.starts_with("18f00000000-"));
        assert!(earlier < later);
    }

    #[test]
    fn test_ordered_ids_are_unique() {
        let a = generate_ordered_id();
        let b = generate_ordered_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("example-1.2").is_ok());
        assert!(validate_id(&generate_id()).is_ok());
        assert_eq!(validate_id(""), Err(IdError::Invalid(String::new())));
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"a".repeat(65)).is_err());
    }
}
