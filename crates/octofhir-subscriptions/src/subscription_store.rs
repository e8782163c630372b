//! Subscription Store.
//!
//! Reads and parses `Subscription` records from storage and performs status
//! transitions as compare-and-set writes keyed on the record's version id.

use std::sync::Arc;

use octofhir_storage::{FhirStorage, SearchParams, StorageError, StoredResource};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{ChannelType, SubscriptionChannel, SubscriptionRecord, SubscriptionStatus};

const RESOURCE_TYPE: &str = "Subscription";
const DEFAULT_CONTENT_TYPE: &str = "application/fhir+json";

/// Attempts made by [`SubscriptionStore::transition`] before giving up on a
/// contended record.
const MAX_TRANSITION_ATTEMPTS: usize = 5;

pub struct SubscriptionStore {
    storage: Arc<dyn FhirStorage>,
}

impl SubscriptionStore {
    pub fn new(storage: Arc<dyn FhirStorage>) -> Self {
        Self { storage }
    }

    /// Read and parse one subscription.
    pub async fn get(&self, id: &str) -> SubscriptionResult<Option<SubscriptionRecord>> {
        match self.storage.read(RESOURCE_TYPE, id).await? {
            Some(stored) => Ok(Some(parse_subscription(&stored)?)),
            None => Ok(None),
        }
    }

    /// The stored record as is, parseable or not.
    pub async fn read_raw(&self, id: &str) -> SubscriptionResult<Option<StoredResource>> {
        Ok(self.storage.read(RESOURCE_TYPE, id).await?)
    }

    /// Ids of every record whose stored `status` is `status`, including
    /// records that do not parse.
    pub async fn ids_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> SubscriptionResult<Vec<String>> {
        let params = SearchParams::new().with_param("status", status.as_str());
        let result = self.storage.search(RESOURCE_TYPE, &params).await?;
        Ok(result.entries.into_iter().map(|stored| stored.id).collect())
    }

    /// All subscriptions in `status`. Unparseable records are logged and skipped.
    pub async fn find_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> SubscriptionResult<Vec<SubscriptionRecord>> {
        let params = SearchParams::new().with_param("status", status.as_str());
        let result = self.storage.search(RESOURCE_TYPE, &params).await?;

        Ok(result
            .entries
            .iter()
            .filter_map(|stored| match parse_subscription(stored) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %stored.id,
                        error = %e,
                        "Failed to parse Subscription, skipping"
                    );
                    None
                }
            })
            .collect())
    }

    /// Active subscriptions bound to `topic_url`.
    pub async fn find_active_for_topic(
        &self,
        topic_url: &str,
    ) -> SubscriptionResult<Vec<SubscriptionRecord>> {
        let mut records = self.find_by_status(SubscriptionStatus::Active).await?;
        records.retain(|r| r.topic_url == topic_url);
        Ok(records)
    }

    /// Move `record` to `to`, provided nobody changed it since it was read.
    ///
    /// `error` replaces the record's `error` text; `None` clears it.
    pub async fn compare_and_set_status(
        &self,
        record: &SubscriptionRecord,
        to: SubscriptionStatus,
        error: Option<&str>,
    ) -> SubscriptionResult<SubscriptionRecord> {
        if !record.status.can_transition_to(to) {
            return Err(SubscriptionError::InvalidTransition {
                from: record.status,
                to,
            });
        }

        let mut body = record.resource.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("status".to_string(), json!(to.as_str()));
            match error {
                Some(text) => {
                    obj.insert("error".to_string(), json!(text));
                }
                None => {
                    obj.remove("error");
                }
            }
        }

        match self.storage.update(&body, Some(&record.version_id)).await {
            Ok(stored) => {
                tracing::info!(
                    subscription_id = %record.id,
                    from = %record.status,
                    to = %to,
                    "Subscription status changed"
                );
                parse_subscription(&stored)
            }
            Err(StorageError::VersionConflict { .. }) => Err(SubscriptionError::ConcurrencyConflict {
                id: record.id.clone(),
            }),
            Err(StorageError::NotFound { .. }) => {
                Err(SubscriptionError::SubscriptionNotFound(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a `requested` record that does not parse to `error`, with
    /// `reason` as its error text.
    ///
    /// Returns `false` when the record is gone, is not `requested`, or was
    /// changed since it was read; the next evaluation picks it up again.
    pub async fn fail_unparseable(&self, id: &str, reason: &str) -> SubscriptionResult<bool> {
        let Some(stored) = self.read_raw(id).await? else {
            return Ok(false);
        };
        let requested = SubscriptionStatus::Requested.as_str();
        match stored.resource.get("status") {
            None => {}
            Some(status) if status.as_str() == Some(requested) => {}
            Some(_) => return Ok(false),
        }

        let mut body = stored.resource.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("status".to_string(), json!(SubscriptionStatus::Error.as_str()));
            obj.insert("error".to_string(), json!(reason));
        }

        match self.storage.update(&body, Some(&stored.version_id)).await {
            Ok(_) => {
                tracing::info!(
                    subscription_id = %id,
                    from = %SubscriptionStatus::Requested,
                    to = %SubscriptionStatus::Error,
                    "Subscription status changed"
                );
                Ok(true)
            }
            Err(StorageError::VersionConflict { .. } | StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read and compare-and-set until the transition lands.
    ///
    /// Returns `Ok(None)` when the record is already in `to`.
    pub async fn transition(
        &self,
        id: &str,
        to: SubscriptionStatus,
        error: Option<&str>,
    ) -> SubscriptionResult<Option<SubscriptionRecord>> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let record = self
                .get(id)
                .await?
                .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.to_string()))?;

            if record.status == to {
                return Ok(None);
            }

            match self.compare_and_set_status(&record, to, error).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(subscription_id = %id, "Status transition lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SubscriptionError::ConcurrencyConflict { id: id.to_string() })
    }

    /// Remove the record.
    pub async fn purge(&self, id: &str) -> SubscriptionResult<()> {
        match self.storage.delete(RESOURCE_TYPE, id).await {
            Ok(()) | Err(StorageError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Check that a Subscription body would parse, before it is stored.
pub fn validate_subscription(resource: &Value) -> SubscriptionResult<()> {
    parse_subscription(&StoredResource::new("", "", RESOURCE_TYPE, resource.clone())).map(|_| ())
}

/// Parse a stored Subscription.
///
/// R5 fields win over their R4 backport equivalents: `topic` over `criteria`,
/// `channelType.code` over `channel.type`, `endpoint` over `channel.endpoint`.
pub fn parse_subscription(stored: &StoredResource) -> SubscriptionResult<SubscriptionRecord> {
    let resource = &stored.resource;

    let topic_url = resource
        .get("topic")
        .and_then(Value::as_str)
        .or_else(|| {
            // Backport criteria may carry filters after '?'
            resource
                .get("criteria")
                .and_then(Value::as_str)
                .map(|c| c.split('?').next().unwrap_or(c))
        })
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SubscriptionError::validation("Subscription missing topic or criteria"))?
        .to_string();

    let status = match resource.get("status").and_then(Value::as_str) {
        Some(code) => SubscriptionStatus::from_code(code).ok_or_else(|| {
            SubscriptionError::validation(format!("Unknown subscription status: {code}"))
        })?,
        None => SubscriptionStatus::Requested,
    };

    let channel = parse_channel(resource)?;

    let end = match resource.get("end").and_then(Value::as_str) {
        Some(s) => Some(OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
            SubscriptionError::validation(format!("Invalid end instant {s}: {e}"))
        })?),
        None => None,
    };

    Ok(SubscriptionRecord {
        id: stored.id.clone(),
        version_id: stored.version_id.clone(),
        topic_url,
        status,
        channel,
        reason: string_field(resource, "reason"),
        error: string_field(resource, "error"),
        end,
        created_at: stored.created_at,
        resource: resource.clone(),
    })
}

fn parse_channel(resource: &Value) -> SubscriptionResult<SubscriptionChannel> {
    let legacy = resource.get("channel");

    let code = resource
        .get("channelType")
        .and_then(|ct| ct.get("code"))
        .and_then(Value::as_str)
        .or_else(|| {
            let ty = legacy?.get("type")?;
            ty.get("coding")
                .and_then(Value::as_array)
                .and_then(|codings| codings.first())
                .and_then(|c| c.get("code"))
                .and_then(Value::as_str)
                .or_else(|| ty.as_str())
        })
        .ok_or_else(|| SubscriptionError::validation("Subscription missing channel type"))?;

    let endpoint = resource
        .get("endpoint")
        .and_then(Value::as_str)
        .or_else(|| legacy?.get("endpoint")?.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let content_type = resource
        .get("contentType")
        .and_then(Value::as_str)
        .or_else(|| legacy?.get("payload")?.as_str())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    Ok(SubscriptionChannel {
        channel_type: ChannelType::from_code(code),
        endpoint,
        content_type,
    })
}

fn string_field(resource: &Value, key: &str) -> Option<String> {
    resource.get(key).and_then(Value::as_str).map(str::to_string)
}
