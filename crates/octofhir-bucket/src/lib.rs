//! Bulk loader for FHIR resources stored as NDJSON and JSON objects in
//! object-store buckets.
//!
//! A [`BucketScanner`] registers objects with the backing store
//! ([`DataAccess`]). One [`JobAllocator`] per file type claims registered
//! objects as jobs while it has capacity. Each job is read by the
//! [`StreamProcessor`], which validates every resource and hands it to the
//! [`ResourceDispatcher`] for bounded-concurrency processing. Oversized
//! transaction bundles can be split into fragments by the
//! [`BundleSplitter`], with bundle-local references rewritten to the
//! identifiers assigned across the whole bundle.

pub mod allocator;
pub mod bundle;
pub mod capacity;
pub mod config;
pub mod data_access;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod loader;
pub mod object_store;
pub mod observability;
pub mod processor;
pub mod scanner;
pub mod stop;
pub mod stream;
pub mod validation;

pub use allocator::{AllocatorOptions, AllocatorState, JobAllocator, JobHandler};
pub use bundle::{BundleSplitter, LocalReferenceMap, SplitFragment};
pub use capacity::CapacityLimiter;
pub use config::BucketConfig;
pub use data_access::{DataAccess, InMemoryDataAccess, ResourceBundleError, ResourceRef};
pub use dispatcher::ResourceDispatcher;
pub use error::{BucketError, Result};
pub use job::{FileType, Job, JobStats, JobTracker, ResourceEntry};
pub use loader::{BucketLoader, build_processor};
pub use object_store::{BucketItem, FsObjectStore, MemoryObjectStore, ObjectStore};
pub use processor::{BundleBreakerProcessor, ResourceProcessor, StorageResourceProcessor};
pub use scanner::{BucketScanner, ScanSummary};
pub use stream::{StreamProcessor, StreamSummary, entry_cost};
pub use validation::{BasicResourceValidator, ResourceValidator, ValidationIssue};
