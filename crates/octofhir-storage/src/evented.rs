//! EventedStorage - a storage wrapper that feeds committed writes to the
//! resource write feed.
//!
//! # Example
//!
//! ```ignore
//! use octofhir_storage::EventedStorage;
//! use octofhir_core::events::EventBroadcaster;
//!
//! let broadcaster = EventBroadcaster::new_shared();
//! let storage = EventedStorage::new(InMemoryStorage::new(), broadcaster);
//!
//! // An Updated event carrying the new version id is emitted afterwards
//! storage.update(&subscription_json, Some("3")).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::events::{EventBroadcaster, ResourceEvent};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::traits::FhirStorage;
use crate::types::{SearchParams, SearchResult, StoredResource};
use serde_json::Value;

/// A storage wrapper that emits events after successful writes.
///
/// Events are emitted **after** the inner write succeeds, so every event
/// corresponds to a committed change. Writes go through a single commit lock
/// that also covers the emit, which makes feed order equal commit order.
pub struct EventedStorage<S: FhirStorage> {
    inner: S,
    broadcaster: Arc<EventBroadcaster>,
    commit_lock: Mutex<()>,
}

impl<S: FhirStorage> EventedStorage<S> {
    /// Create a new evented storage wrapper.
    pub fn new(inner: S, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            inner,
            broadcaster,
            commit_lock: Mutex::new(()),
        }
    }

    /// Get a reference to the inner storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get a reference to the broadcaster.
    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    fn emit(&self, event: ResourceEvent) {
        if !self.broadcaster.has_subscribers() {
            return;
        }
        let kind = event.event_type;
        let reference = event.reference();
        let receivers = self.broadcaster.send(event);
        debug!(
            event = %kind,
            resource = %reference,
            receivers,
            "Emitted resource event"
        );
    }
}

#[async_trait]
impl<S: FhirStorage> FhirStorage for EventedStorage<S> {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let _guard = self.commit_lock.lock().await;
        let result = self.inner.create(resource).await?;

        self.emit(
            ResourceEvent::created(&result.resource_type, &result.id, result.resource.clone())
                .with_version(&result.version_id),
        );

        Ok(result)
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        self.inner.read(resource_type, id).await
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let _guard = self.commit_lock.lock().await;
        let result = self.inner.update(resource, if_match).await?;

        self.emit(
            ResourceEvent::updated(&result.resource_type, &result.id, result.resource.clone())
                .with_version(&result.version_id),
        );

        Ok(result)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let _guard = self.commit_lock.lock().await;
        self.inner.delete(resource_type, id).await?;

        self.emit(ResourceEvent::deleted(resource_type, id));

        Ok(())
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError> {
        self.inner.search(resource_type, params).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

impl<S: FhirStorage> std::fmt::Debug for EventedStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventedStorage")
            .field("backend", &self.inner.backend_name())
            .field("subscriber_count", &self.broadcaster.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_core::events::ResourceEventType;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::HashMap;

    /// Minimal map-backed store, enough to drive the wrapper.
    #[derive(Default)]
    struct MapStorage {
        records: SyncMutex<HashMap<(String, String), StoredResource>>,
    }

    #[async_trait]
    impl FhirStorage for MapStorage {
        async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
            let rt = resource["resourceType"].as_str().unwrap_or_default().to_string();
            let id = resource["id"].as_str().unwrap_or("generated").to_string();
            let stored = StoredResource::new(&id, "1", &rt, resource.clone());
            self.records.lock().insert((rt, id), stored.clone());
            Ok(stored)
        }

        async fn read(&self, rt: &str, id: &str) -> Result<Option<StoredResource>, StorageError> {
            Ok(self
                .records
                .lock()
                .get(&(rt.to_string(), id.to_string()))
                .cloned())
        }

        async fn update(
            &self,
            resource: &Value,
            if_match: Option<&str>,
        ) -> Result<StoredResource, StorageError> {
            let rt = resource["resourceType"].as_str().unwrap_or_default().to_string();
            let id = resource["id"].as_str().unwrap_or_default().to_string();
            let mut records = self.records.lock();
            let current = records
                .get(&(rt.clone(), id.clone()))
                .ok_or_else(|| StorageError::not_found(&rt, &id))?;
            if let Some(expected) = if_match {
                if expected != current.version_id {
                    return Err(StorageError::version_conflict(
                        expected,
                        &current.version_id,
                    ));
                }
            }
            let next: u64 = current.version_id.parse().unwrap_or(0) + 1;
            let stored = current.new_version(next.to_string(), resource.clone());
            records.insert((rt, id), stored.clone());
            Ok(stored)
        }

        async fn delete(&self, rt: &str, id: &str) -> Result<(), StorageError> {
            self.records
                .lock()
                .remove(&(rt.to_string(), id.to_string()))
                .map(|_| ())
                .ok_or_else(|| StorageError::not_found(rt, id))
        }

        async fn search(
            &self,
            _rt: &str,
            _params: &SearchParams,
        ) -> Result<SearchResult, StorageError> {
            Ok(SearchResult::empty())
        }

        fn backend_name(&self) -> &'static str {
            "map"
        }
    }

    #[tokio::test]
    async fn test_writes_emit_events_with_versions() {
        let broadcaster = EventBroadcaster::new_shared();
        let mut rx = broadcaster.subscribe();
        let storage = EventedStorage::new(MapStorage::default(), broadcaster);

        let obs = json!({"resourceType": "Observation", "id": "o1", "status": "final"});
        storage.create(&obs).await.unwrap();
        storage.update(&obs, Some("1")).await.unwrap();
        storage.delete("Observation", "o1").await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.event_type, ResourceEventType::Created);
        assert_eq!(created.version_id.as_deref(), Some("1"));

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.event_type, ResourceEventType::Updated);
        assert_eq!(updated.version_id.as_deref(), Some("2"));

        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.event_type, ResourceEventType::Deleted);
        assert_eq!(deleted.resource_id, "o1");
    }

    #[tokio::test]
    async fn test_failed_writes_and_reads_do_not_emit() {
        let broadcaster = EventBroadcaster::new_shared();
        let mut rx = broadcaster.subscribe();
        let storage = EventedStorage::new(MapStorage::default(), broadcaster);

        let obs = json!({"resourceType": "Observation", "id": "o1"});
        storage.create(&obs).await.unwrap();
        let _ = rx.recv().await.unwrap();

        let err = storage.update(&obs, Some("7")).await.unwrap_err();
        assert!(err.is_version_conflict());
        storage.read("Observation", "o1").await.unwrap();

        assert!(rx.try_recv().is_err());
    }
}
