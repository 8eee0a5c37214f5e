//! Transaction bundle handling: local identifier resolution, reference
//! rewriting and splitting.

pub mod rewrite;
pub mod splitter;

pub use rewrite::{LocalReferenceMap, rewrite_own_id, rewrite_references, rewrite_resource};
pub use splitter::{BundleSplitter, SplitFragment, fragment_key, output_key};

use octofhir_core::bundle::{full_url, request_url};
use octofhir_core::{
    EntryMethod, FhirReference, generate_ordered_id, is_local_identifier, parse_reference,
    resource_id, resource_type,
};
use serde_json::Value;

/// The entry's `fullUrl` when it is a bundle-local identifier.
pub fn local_identifier(entry: &Value) -> Option<&str> {
    full_url(entry).filter(|url| is_local_identifier(url))
}

/// The `Type/id` an entry addresses: the resource's own type and id, or else
/// the request URL.
pub fn addressed_reference(entry: &Value) -> Option<FhirReference> {
    entry
        .get("resource")
        .and_then(|resource| Some(FhirReference::new(resource_type(resource)?, resource_id(resource)?)))
        .or_else(|| request_url(entry).and_then(|url| parse_reference(url).ok()))
}

/// Builds the local identifier map for a set of bundle entries.
///
/// PUT and DELETE entries map to the reference they address. POST entries
/// get a freshly generated ordered id. Other methods get no mapping. The map
/// must be complete before any entry is rewritten, since entries may refer
/// to identifiers declared later in the bundle.
pub fn resolve_local_identifiers(entries: &[Value]) -> LocalReferenceMap {
    let mut map = LocalReferenceMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let Some(local) = local_identifier(entry) else {
            continue;
        };
        let method = EntryMethod::of_entry(entry);
        let external = match method {
            Some(EntryMethod::Put | EntryMethod::Delete) => {
                addressed_reference(entry).map(|r| r.to_relative())
            }
            Some(EntryMethod::Post) => entry
                .get("resource")
                .and_then(resource_type)
                .map(|rt| format!("{rt}/{}", generate_ordered_id())),
            _ => continue,
        };
        match external {
            Some(external) => {
                if let Some(previous) = map.insert(local.to_string(), external) {
                    tracing::warn!(index, local, previous, "Duplicate local identifier in bundle");
                }
            }
            None => {
                tracing::warn!(
                    index,
                    local,
                    method = ?method,
                    "Cannot resolve local identifier: entry has no resource type or id"
                );
            }
        }
    }
    map
}

/// Id part of a `Type/id` reference produced by [`resolve_local_identifiers`].
pub(crate) fn reference_id(reference: &str) -> Option<&str> {
    reference.split('/').nth(1).filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_by_method() {
        let entries = vec![
            json!({
                "fullUrl": "urn:uuid:a",
                "resource": {"resourceType": "Patient"},
                "request": {"method": "POST", "url": "Patient"}
            }),
            json!({
                "fullUrl": "resource:b",
                "resource": {"resourceType": "Patient", "id": "p2"},
                "request": {"method": "PUT", "url": "Patient/p2"}
            }),
            json!({
                "fullUrl": "urn:uuid:c",
                "request": {"method": "DELETE", "url": "Observation/o1"}
            }),
            json!({
                "fullUrl": "urn:uuid:d",
                "request": {"method": "GET", "url": "Patient/p9"}
            }),
            json!({
                "fullUrl": "http://example.org/Patient/p3",
                "resource": {"resourceType": "Patient", "id": "p3"},
                "request": {"method": "PUT", "url": "Patient/p3"}
            }),
        ];
        let map = resolve_local_identifiers(&entries);
        assert_eq!(map.len(), 3);
        assert!(map["urn:uuid:a"].starts_with("Patient/"));
        assert_eq!(map["resource:b"], "Patient/p2");
        assert_eq!(map["urn:uuid:c"], "Observation/o1");
        assert!(!map.contains_key("urn:uuid:d"));

        let id = reference_id(&map["urn:uuid:a"]).unwrap();
        assert!(octofhir_core::validate_id(id).is_ok());
    }

    #[test]
    fn test_put_without_id_falls_back_to_request_url() {
        let entry = json!({
            "fullUrl": "urn:uuid:x",
            "resource": {"resourceType": "Patient"},
            "request": {"method": "PUT", "url": "Patient/from-url"}
        });
        assert_eq!(
            addressed_reference(&entry).unwrap().to_relative(),
            "Patient/from-url"
        );
    }
}
