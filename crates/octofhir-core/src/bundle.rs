//! Bundle entry helpers.
//!
//! Bundles are handled as raw JSON; these helpers read the parts the loader
//! cares about (bundle type, entry request method, fullUrl).

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::CoreError;

/// The `Bundle.type` values that matter when loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleKind {
    Transaction,
    Batch,
    Collection,
    Other(String),
}

impl BundleKind {
    /// Reads `Bundle.type`, returning `None` when it is missing.
    pub fn of(bundle: &Value) -> Option<Self> {
        let kind = bundle.get("type").and_then(Value::as_str)?;
        Some(match kind {
            "transaction" => Self::Transaction,
            "batch" => Self::Batch,
            "collection" => Self::Collection,
            other => Self::Other(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Transaction => "transaction",
            Self::Batch => "batch",
            Self::Collection => "collection",
            Self::Other(s) => s,
        }
    }
}

/// `Bundle.entry.request.method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl EntryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Reads the request method of a bundle entry.
    pub fn of_entry(entry: &Value) -> Option<Self> {
        entry
            .pointer("/request/method")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
    }
}

impl fmt::Display for EntryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(CoreError::invalid_bundle(format!(
                "unknown request method: {other}"
            ))),
        }
    }
}

/// Returns the entries of a bundle, or an empty slice.
pub fn entries(bundle: &Value) -> &[Value] {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Returns `Bundle.entry.fullUrl`.
pub fn full_url(entry: &Value) -> Option<&str> {
    entry.get("fullUrl").and_then(Value::as_str)
}

/// Returns `Bundle.entry.request.url`.
pub fn request_url(entry: &Value) -> Option<&str> {
    entry.pointer("/request/url").and_then(Value::as_str)
}
