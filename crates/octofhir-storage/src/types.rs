use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One version of a resource as held by a backend.
///
/// `resource` already carries the assigned `id` and `meta.versionId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    pub version_id: String,
    pub resource_type: String,
    pub resource: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Time of the first version; carried forward unchanged by updates.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl StoredResource {
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: now,
            created_at: now,
        }
    }

    /// Successor of this version with a new body.
    pub fn new_version(&self, version_id: impl Into<String>, resource: Value) -> Self {
        Self {
            version_id: version_id.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub entries: Vec<StoredResource>,
    /// Matches before `count` truncated `entries`.
    pub total: Option<u32>,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<StoredResource>) -> Self {
        Self {
            entries,
            total: None,
        }
    }

    pub fn with_total(self, total: u32) -> Self {
        Self {
            total: Some(total),
            ..self
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Equality filter over top-level fields.
///
/// Values listed under one key are alternatives; distinct keys must all
/// match. A string field is compared as is, an object field by its `code`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub parameters: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_count(self, count: u32) -> Self {
        Self {
            count: Some(count),
            ..self
        }
    }

    pub fn matches(&self, resource: &Value) -> bool {
        self.parameters
            .iter()
            .all(|(key, wanted)| match field_token(resource.get(key)) {
                Some(actual) => wanted.iter().any(|w| w == actual),
                None => false,
            })
    }
}

fn field_token(field: Option<&Value>) -> Option<&str> {
    match field? {
        Value::String(s) => Some(s),
        Value::Object(obj) => obj.get("code")?.as_str(),
        _ => None,
    }
}
