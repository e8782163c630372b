use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use octofhir_storage::StoredResource;

/// `(resourceType, id)`.
pub type StorageKey = (String, String);

pub(crate) fn key(resource_type: &str, id: &str) -> StorageKey {
    (resource_type.to_owned(), id.to_owned())
}

/// Process-local resource store.
///
/// One `DashMap` holds the current version of every record. A conditional
/// update holds the shard lock from the version check to the replace.
/// Version ids come from a single counter and so increase in commit order
/// across all types.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    pub(crate) data: DashMap<StorageKey, StoredResource>,
    last_version: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_version(&self) -> String {
        (self.last_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
