//! Shared building blocks: the resource write feed (`events`), the FHIR
//! resource type catalogue and logical id helpers.

pub mod events;
pub mod fhir;
pub mod id;

pub use fhir::{is_known_resource_type, is_valid_resource_type_name};
pub use id::{IdError, generate_id, validate_id};
