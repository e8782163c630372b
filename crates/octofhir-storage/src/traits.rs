use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{SearchParams, SearchResult, StoredResource};

/// Resource store used by the subscription engine and the REST layer.
///
/// The conditional form of [`update`](FhirStorage::update) is the only
/// concurrency primitive the engine relies on: status transitions are
/// read, modify, then `update(.., Some(version))`, retried on conflict.
#[async_trait]
pub trait FhirStorage: Send + Sync {
    /// Store a new resource. A missing `id` is generated.
    ///
    /// Fails with `AlreadyExists` when the id is taken and with
    /// `InvalidResource` when `resourceType` is missing or unknown.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Replace an existing resource, identified by its `resourceType` and `id`.
    ///
    /// With `if_match`, the write only happens if the stored version equals
    /// it, checked and applied atomically; otherwise `VersionConflict`.
    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError>;

    /// `NotFound` if there is nothing to delete.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError>;

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError>;

    fn backend_name(&self) -> &'static str;
}
