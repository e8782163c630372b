use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Kind of committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceEventType {
    Created,
    Updated,
    Deleted,
}

impl ResourceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed write, as seen by hooks.
///
/// `resource` is the stored body after the write; deletions carry `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: ResourceEventType,
    pub resource_type: String,
    pub resource_id: String,
    pub version_id: Option<String>,
    pub resource: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ResourceEvent {
    fn build(
        event_type: ResourceEventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: Option<Value>,
    ) -> Self {
        Self {
            event_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            version_id: None,
            resource,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn created(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self::build(ResourceEventType::Created, resource_type, resource_id, Some(resource))
    }

    pub fn updated(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self::build(ResourceEventType::Updated, resource_type, resource_id, Some(resource))
    }

    pub fn deleted(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::build(ResourceEventType::Deleted, resource_type, resource_id, None)
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// Relative reference `Type/id`, used in logs.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}
