use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::trace;

use octofhir_core::{generate_id, is_valid_resource_type_name, validate_id};
use octofhir_storage::{FhirStorage, SearchParams, SearchResult, StorageError, StoredResource};

use crate::storage::{InMemoryStorage, key};

fn extract_resource_type(resource: &Value) -> Result<String, StorageError> {
    let resource_type = resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StorageError::invalid_resource("Missing resourceType field"))?;
    if !is_valid_resource_type_name(resource_type) {
        return Err(StorageError::invalid_resource(format!(
            "Invalid resourceType: {resource_type}"
        )));
    }
    Ok(resource_type.to_string())
}

/// `None` when the body has no id; an id that is present must be valid.
fn extract_id(resource: &Value) -> Result<Option<String>, StorageError> {
    match resource.get("id").and_then(|v| v.as_str()) {
        Some(id) => {
            validate_id(id).map_err(|e| StorageError::invalid_resource(e.to_string()))?;
            Ok(Some(id.to_string()))
        }
        None => Ok(None),
    }
}

/// Stamps `id` and `meta` onto the resource body.
fn with_meta(resource: &Value, id: &str, version_id: &str, now: OffsetDateTime) -> Value {
    let mut body = resource.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.to_string()));
        obj.insert(
            "meta".to_string(),
            json!({
                "versionId": version_id,
                "lastUpdated": now.format(&Rfc3339).unwrap_or_default()
            }),
        );
    }
    body
}

#[async_trait]
impl FhirStorage for InMemoryStorage {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource)?.unwrap_or_else(generate_id);
        match self.data.entry(key(&resource_type, &id)) {
            Entry::Occupied(_) => Err(StorageError::already_exists(&resource_type, &id)),
            Entry::Vacant(slot) => {
                let version_id = self.next_version();
                let now = OffsetDateTime::now_utc();
                let body = with_meta(resource, &id, &version_id, now);
                let stored = StoredResource::new(&id, version_id, &resource_type, body);
                slot.insert(stored.clone());
                trace!(resource_type = %resource_type, id = %id, "Created resource");
                Ok(stored)
            }
        }
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        Ok(self.data.get(&key(resource_type, id)).map(|r| r.value().clone()))
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource)?
            .ok_or_else(|| StorageError::invalid_resource("Missing id field for update"))?;
        // Shard write lock held from the version check to the replace.
        let mut existing = self
            .data
            .get_mut(&key(&resource_type, &id))
            .ok_or_else(|| StorageError::not_found(&resource_type, &id))?;

        if let Some(expected) = if_match {
            if existing.version_id != expected {
                return Err(StorageError::version_conflict(
                    expected,
                    existing.version_id.clone(),
                ));
            }
        }

        let version_id = self.next_version();
        let now = OffsetDateTime::now_utc();
        let body = with_meta(resource, &id, &version_id, now);
        let stored = existing.new_version(version_id, body);
        *existing = stored.clone();
        trace!(
            resource_type = %resource_type,
            id = %id,
            version_id = %stored.version_id,
            "Updated resource"
        );

        Ok(stored)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        self.data
            .remove(&key(resource_type, id))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(resource_type, id))
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError> {
        let mut entries: Vec<StoredResource> = self
            .data
            .iter()
            .filter(|r| r.key().0 == resource_type && params.matches(&r.value().resource))
            .map(|r| r.value().clone())
            .collect();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let total = entries.len() as u32;
        if let Some(count) = params.count {
            entries.truncate(count as usize);
        }

        Ok(SearchResult::with_entries(entries).with_total(total))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
