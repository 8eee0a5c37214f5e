//! In-memory storage backend for the OctoFHIR bulk loader.
//!
//! This crate provides an in-memory implementation of the `FhirStorage` trait
//! from `octofhir-storage`. Every version of every resource is kept, so
//! history, vread and logical deletes behave like a persistent backend.
//!
//! # Example
//!
//! ```ignore
//! use octofhir_db_memory::InMemoryStorage;
//! use octofhir_storage::FhirStorage;
//!
//! let storage = InMemoryStorage::new();
//!
//! let patient = serde_json::json!({
//!     "resourceType": "Patient",
//!     "name": [{"family": "Smith"}]
//! });
//! let created = storage.create(&patient).await?;
//! ```

pub mod query;
pub mod storage;

pub use octofhir_storage::{FhirStorage, StorageError, StoredResource};
pub use storage::{InMemoryStorage, StorageKey};

/// Creates a new shareable in-memory storage instance.
pub fn create_fhir_storage() -> octofhir_storage::DynStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
