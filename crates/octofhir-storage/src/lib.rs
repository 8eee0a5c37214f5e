//! # octofhir-storage
//!
//! Persistence contract for resources written by the bulk loader.
//!
//! This crate defines the traits and types that storage backends implement.
//! It does not contain any implementations; `octofhir-db-memory` provides
//! the in-memory one.
//!
//! ## Overview
//!
//! The main trait is [`FhirStorage`], which defines:
//! - CRUD operations with optimistic concurrency (`if_match`)
//! - Logical deletes and physical `erase`
//! - Versioning (vread, history)
//! - Search
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_storage::{FhirStorage, SearchParams, StorageError, StoredResource};
//!
//! async fn observations_for(
//!     storage: &dyn FhirStorage,
//!     patient: &str,
//! ) -> Result<Vec<StoredResource>, StorageError> {
//!     let params = SearchParams::new()
//!         .with_param("subject", format!("Patient/{patient}"))
//!         .with_count(10);
//!
//!     let result = storage.search("Observation", &params).await?;
//!     Ok(result.entries)
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::StorageError;
pub use traits::FhirStorage;
pub use types::{
    HistoryEntry, HistoryMethod, HistoryParams, HistoryResult, SearchParams, SearchResult,
    StoredResource,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage trait object.
pub type DynStorage = std::sync::Arc<dyn FhirStorage>;
