//! Resource store contract.
//!
//! [`FhirStorage`] is what a backend implements. [`EventedStorage`] wraps any
//! backend and publishes each committed write on the write feed.
//!
//! ```ignore
//! use octofhir_storage::{FhirStorage, SearchParams, StorageError, StoredResource};
//!
//! async fn active_subscriptions(
//!     storage: &dyn FhirStorage,
//! ) -> Result<Vec<StoredResource>, StorageError> {
//!     let params = SearchParams::new().with_param("status", "active");
//!     Ok(storage.search("Subscription", &params).await?.entries)
//! }
//! ```

mod error;
pub mod evented;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use evented::EventedStorage;
pub use traits::FhirStorage;
pub use types::{SearchParams, SearchResult, StoredResource};

/// Shared handle to a backend.
pub type DynStorage = std::sync::Arc<dyn FhirStorage>;
