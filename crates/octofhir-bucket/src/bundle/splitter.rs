//! Splits oversized transaction bundles into fixed-size fragments.
//!
//! Bundles within the size limit pass through untouched under their original
//! name. Larger bundles are rewritten in two passes: local identifiers are
//! first resolved to `Type/id` references for the whole bundle, then every
//! entry is rewritten against that map and POST entries become PUTs with
//! their generated ids. Fragments are named `{stem}_SUB{n:03}.json`.

use octofhir_core::bundle::entries;
use octofhir_core::{EntryMethod, is_bundle};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::rewrite::{LocalReferenceMap, rewrite_resource};
use super::{addressed_reference, local_identifier, reference_id, resolve_local_identifiers};
use crate::error::{BucketError, Result};

/// One output bundle and the object name it should be stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitFragment {
    pub name: String,
    pub bundle: Value,
}

impl SplitFragment {
    pub fn entry_count(&self) -> usize {
        entries(&self.bundle).len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BundleSplitter {
    max_bundle_size: usize,
}

impl BundleSplitter {
    pub fn new(max_bundle_size: usize) -> Self {
        Self {
            max_bundle_size: max_bundle_size.max(1),
        }
    }

    pub fn max_bundle_size(&self) -> usize {
        self.max_bundle_size
    }

    /// Splits `bundle`, originally stored as `original_name`.
    ///
    /// # Errors
    ///
    /// `InvalidBundleName` when the name does not end in `.json`/`.JSON`;
    /// `InvalidBundle` when the input is not a Bundle.
    pub fn split(&self, original_name: &str, bundle: &Value) -> Result<Vec<SplitFragment>> {
        let stem = name_stem(original_name)?;
        if !is_bundle(bundle) {
            return Err(BucketError::invalid_bundle(format!(
                "{original_name} is not a Bundle"
            )));
        }

        let input = entries(bundle);
        if input.len() <= self.max_bundle_size {
            return Ok(vec![SplitFragment {
                name: original_name.to_string(),
                bundle: bundle.clone(),
            }]);
        }

        let map = resolve_local_identifiers(input);
        let rewritten: Vec<Value> = input
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| rewrite_entry(index, entry, &map))
            .collect();

        let fragments: Vec<SplitFragment> = rewritten
            .chunks(self.max_bundle_size)
            .enumerate()
            .map(|(index, chunk)| SplitFragment {
                name: fragment_name(stem, index),
                bundle: transaction_bundle(chunk.to_vec()),
            })
            .collect();

        debug!(
            name = original_name,
            entries = input.len(),
            kept = rewritten.len(),
            fragments = fragments.len(),
            "Split bundle"
        );
        Ok(fragments)
    }
}

fn name_stem(name: &str) -> Result<&str> {
    name.strip_suffix(".json")
        .or_else(|| name.strip_suffix(".JSON"))
        .ok_or_else(|| BucketError::InvalidBundleName(name.to_string()))
}

fn fragment_name(stem: &str, index: usize) -> String {
    format!("{stem}_SUB{index:03}.json")
}

/// Joins an output prefix and an object name with `/`.
pub fn output_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Key of fragment `index` of `original_name` under `prefix`.
pub fn fragment_key(prefix: &str, original_name: &str, index: usize) -> Result<String> {
    let stem = name_stem(original_name)?;
    Ok(output_key(prefix, &fragment_name(stem, index)))
}

fn transaction_bundle(entries: Vec<Value>) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": entries,
    })
}

fn with_request(resource: Option<Value>, full_url: &str, method: EntryMethod) -> Value {
    let mut entry = json!({
        "fullUrl": full_url,
        "request": {"method": method.as_str(), "url": full_url},
    });
    if let Some(resource) = resource {
        entry["resource"] = resource;
    }
    entry
}

/// Rewrites one entry against the completed map, or drops it.
fn rewrite_entry(index: usize, entry: &Value, map: &LocalReferenceMap) -> Option<Value> {
    let Some(local) = local_identifier(entry) else {
        debug!(index, "Dropping entry without a local identifier");
        return None;
    };
    let resource = entry.get("resource");

    match EntryMethod::of_entry(entry) {
        Some(EntryMethod::Put) => {
            let Some(target) = addressed_reference(entry) else {
                warn!(index, local, "PUT entry has no resolvable Type/id; dropping it");
                return None;
            };
            let external = target.to_relative();
            let resource = resource.map(|r| rewrite_resource(r, map, None).0);
            Some(with_request(resource, &external, EntryMethod::Put))
        }
        Some(EntryMethod::Post) => {
            let Some(external) = map.get(local) else {
                warn!(index, local, "No generated id for POST entry; dropping it");
                return None;
            };
            let Some(new_id) = reference_id(external) else {
                warn!(
                    index,
                    local,
                    external = %external,
                    "Generated reference has no id; dropping entry"
                );
                return None;
            };
            let resource = resource.map(|r| rewrite_resource(r, map, Some(new_id)).0);
            Some(with_request(resource, external, EntryMethod::Put))
        }
        Some(EntryMethod::Delete) => {
            let Some(external) = map.get(local) else {
                warn!(index, local, "DELETE entry has no resolvable target; dropping it");
                return None;
            };
            let resource = resource.map(|r| rewrite_resource(r, map, None).0);
            Some(with_request(resource, external, EntryMethod::Delete))
        }
        other => {
            debug!(index, local, method = ?other, "Dropping entry with unhandled method");
            None
        }
    }
}
