//! Pre-dispatch resource validation.

use octofhir_core::{is_valid_resource_type_name, is_bundle, resource_type, validate_id};
use serde_json::Value;

/// Issue severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Fatal error - processing cannot continue
    Fatal,
    /// Error - resource is invalid
    Error,
    /// Warning - resource is valid but has issues
    Warning,
    /// Information - informational note
    Information,
}

impl IssueSeverity {
    /// Convert to FHIR string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Fatal => "fatal",
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Information => "information",
        }
    }

    /// Whether an issue of this severity rejects the resource.
    pub fn is_failure(&self) -> bool {
        matches!(self, IssueSeverity::Fatal | IssueSeverity::Error)
    }
}

/// Single validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Issue code
    pub code: String,
    /// Human-readable diagnostics
    pub diagnostics: String,
    /// Location in the resource (FHIRPath expression)
    pub location: Option<String>,
}

impl ValidationIssue {
    pub fn new(
        severity: IssueSeverity,
        code: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            diagnostics: diagnostics.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// `diagnostics` prefixed with the location when there is one.
    pub fn text(&self) -> String {
        match &self.location {
            Some(loc) => format!("{loc}: {}", self.diagnostics),
            None => self.diagnostics.clone(),
        }
    }
}

pub fn has_failures(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity.is_failure())
}

/// Joins the texts of the failure-severity issues.
pub fn failure_message(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .filter(|i| i.severity.is_failure())
        .map(ValidationIssue::text)
        .collect::<Vec<_>>()
        .join("; ")
}

pub trait ResourceValidator: Send + Sync {
    fn validate(&self, resource: &Value) -> Vec<ValidationIssue>;
}

/// Structural checks that need no FHIR definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicResourceValidator;

impl ResourceValidator for BasicResourceValidator {
    fn validate(&self, resource: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if !resource.is_object() {
            issues.push(ValidationIssue::new(
                IssueSeverity::Fatal,
                "structure",
                "resource must be a JSON object",
            ));
            return issues;
        }

        match resource_type(resource) {
            None => issues.push(
                ValidationIssue::new(IssueSeverity::Error, "required", "resourceType is missing")
                    .at("resourceType"),
            ),
            Some(rt) if !is_valid_resource_type_name(rt) => issues.push(
                ValidationIssue::new(
                    IssueSeverity::Error,
                    "value",
                    format!("invalid resourceType '{rt}'"),
                )
                .at("resourceType"),
            ),
            Some(_) => {}
        }

        match resource.get("id") {
            None => {}
            Some(Value::String(id)) => {
                if let Err(e) = validate_id(id) {
                    issues.push(
                        ValidationIssue::new(IssueSeverity::Error, "value", e.to_string())
                            .at("id"),
                    );
                }
            }
            Some(_) => issues.push(
                ValidationIssue::new(IssueSeverity::Error, "value", "id must be a string").at("id"),
            ),
        }

        if is_bundle(resource) {
            validate_bundle(resource, &mut issues);
        }
        issues
    }
}

fn validate_bundle(bundle: &Value, issues: &mut Vec<ValidationIssue>) {
    if bundle.get("type").and_then(Value::as_str).is_none() {
        issues.push(
            ValidationIssue::new(IssueSeverity::Warning, "required", "Bundle.type is missing")
                .at("Bundle.type"),
        );
    }
    match bundle.get("entry") {
        None => {}
        Some(Value::Array(entries)) => {
            for (i, entry) in entries.iter().enumerate() {
                if entry.get("resource").is_none() && entry.get("request").is_none() {
                    issues.push(
                        ValidationIssue::new(
                            IssueSeverity::Error,
                            "required",
                            "entry has neither resource nor request",
                        )
                        .at(format!("Bundle.entry[{i}]")),
                    );
                }
            }
        }
        Some(_) => issues.push(
            ValidationIssue::new(IssueSeverity::Error, "structure", "entry must be an array")
                .at("Bundle.entry"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_resource() {
        let issues = BasicResourceValidator.validate(&json!({"resourceType": "Patient", "id": "p-1"}));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_missing_type_and_bad_id() {
        let issues = BasicResourceValidator.validate(&json!({"id": "has space"}));
        assert_eq!(issues.len(), 2);
        assert!(has_failures(&issues));
        let message = failure_message(&issues);
        assert!(message.contains("resourceType: resourceType is missing"));
        assert!(message.contains("; id: "));
    }

    #[test]
    fn test_non_object() {
        let issues = BasicResourceValidator.validate(&json!([1, 2]));
        assert_eq!(issues[0].severity, IssueSeverity::Fatal);
    }

    #[test]
    fn test_bundle_checks() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"resourceType": "Patient"}}, {"fullUrl": "urn:x"}]
        });
        let issues = BasicResourceValidator.validate(&bundle);
        // missing type is only a warning
        assert!(issues.iter().any(|i| i.severity == IssueSeverity::Warning));
        let failures: Vec<_> = issues.iter().filter(|i| i.severity.is_failure()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].location.as_deref(), Some("Bundle.entry[1]"));
    }

    #[test]
    fn test_warnings_only_are_not_failures() {
        let issues = vec![ValidationIssue::new(IssueSeverity::Warning, "x", "y")];
        assert!(!has_failures(&issues));
        assert_eq!(failure_message(&issues), "");
    }
}
