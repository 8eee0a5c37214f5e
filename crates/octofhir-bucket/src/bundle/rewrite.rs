//! Reference rewriting over raw JSON resources.
//!
//! Both transforms are pure: they return a new tree and whether anything
//! changed, leaving the input untouched.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Bundle-local identifier (`urn:...`, `resource:...`) to `Type/id`.
pub type LocalReferenceMap = HashMap<String, String>;

/// Replaces every `reference` value that exactly matches a key of `map`.
///
/// The whole tree is walked, including `contained` resources and nested
/// elements at any depth.
pub fn rewrite_references(value: &Value, map: &LocalReferenceMap) -> (Value, bool) {
    match value {
        Value::Object(obj) => {
            let mut changed = false;
            let mut out = Map::with_capacity(obj.len());
            for (key, child) in obj {
                let replacement = match child {
                    Value::String(s) if key == "reference" => map.get(s),
                    _ => None,
                };
                let new_child = match replacement {
                    Some(external) => {
                        changed = true;
                        Value::String(external.clone())
                    }
                    None => {
                        let (new_child, child_changed) = rewrite_references(child, map);
                        changed |= child_changed;
                        new_child
                    }
                };
                out.insert(key.clone(), new_child);
            }
            (Value::Object(out), changed)
        }
        Value::Array(items) => {
            let mut changed = false;
            let out = items
                .iter()
                .map(|item| {
                    let (new_item, item_changed) = rewrite_references(item, map);
                    changed |= item_changed;
                    new_item
                })
                .collect();
            (Value::Array(out), changed)
        }
        other => (other.clone(), false),
    }
}

/// Sets the resource's own `id` to `new_id`.
///
/// Resources under `contained` keep their authored ids; they are only
/// addressable through their parent.
pub fn rewrite_own_id(resource: &Value, new_id: &str) -> (Value, bool) {
    let Value::Object(obj) = resource else {
        return (resource.clone(), false);
    };
    let changed = obj.get("id").and_then(Value::as_str) != Some(new_id);
    let mut out = obj.clone();
    out.insert("id".to_string(), Value::String(new_id.to_string()));
    (Value::Object(out), changed)
}

/// Rewrites references and, when `new_id` is given, the resource's own id.
pub fn rewrite_resource(
    resource: &Value,
    map: &LocalReferenceMap,
    new_id: Option<&str>,
) -> (Value, bool) {
    let (rewritten, refs_changed) = rewrite_references(resource, map);
    match new_id {
        Some(id) => {
            let (rewritten, id_changed) = rewrite_own_id(&rewritten, id);
            (rewritten, refs_changed || id_changed)
        }
        None => (rewritten, refs_changed),
    }
}
