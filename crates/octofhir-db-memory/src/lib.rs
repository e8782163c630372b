//! [`FhirStorage`] backed by a sharded in-process map.
//!
//! ```ignore
//! use octofhir_db_memory::InMemoryStorage;
//! use octofhir_storage::FhirStorage;
//!
//! let storage = InMemoryStorage::new();
//! let topic = storage
//!     .create(&serde_json::json!({
//!         "resourceType": "SubscriptionTopic",
//!         "url": "http://example.org/topics/observation-create",
//!         "status": "active"
//!     }))
//!     .await?;
//! ```

mod fhir_impl;
pub mod storage;

pub use octofhir_storage::{FhirStorage, StorageError, StoredResource};
pub use storage::{InMemoryStorage, StorageKey};
