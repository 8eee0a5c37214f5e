pub mod bundle;
pub mod error;
pub mod fhir_reference;
pub mod id;
pub mod resource;

pub use bundle::{BundleKind, EntryMethod};
pub use error::{CoreError, Result};
pub use fhir_reference::{FhirReference, UnresolvableReference, is_local_identifier, parse_reference};
pub use id::{IdError, generate_id, generate_ordered_id, validate_id};
pub use resource::{is_bundle, is_valid_resource_type_name, resource_id, resource_type};
