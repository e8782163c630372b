//! Topic Registry.
//!
//! Keeps an in-memory index of parsed `SubscriptionTopic` resources keyed by
//! canonical url and by resource type. The index is rebuilt from storage by
//! [`TopicRegistry::reload`], which runs on startup and after every topic write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use octofhir_core::is_known_resource_type;
use octofhir_storage::{FhirStorage, SearchParams};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{ResourceTrigger, Topic, TopicStatus, TriggerInteraction};

#[derive(Default)]
struct TopicIndex {
    by_url: HashMap<String, Topic>,
    /// resource_type -> topic urls
    by_type: HashMap<String, HashSet<String>>,
}

/// Registry of subscription topics.
pub struct TopicRegistry {
    storage: Arc<dyn FhirStorage>,
    index: RwLock<TopicIndex>,
}

impl TopicRegistry {
    pub fn new(storage: Arc<dyn FhirStorage>) -> Self {
        Self {
            storage,
            index: RwLock::new(TopicIndex::default()),
        }
    }

    /// Rebuild the index from storage.
    ///
    /// Topics of every status are indexed so activation can tell a draft
    /// topic from a missing one. Invalid topics are logged and left out. On a
    /// storage error the previous index stays in place.
    pub async fn reload(&self) -> SubscriptionResult<()> {
        tracing::debug!("Reloading subscription topics from storage");

        let result = self
            .storage
            .search("SubscriptionTopic", &SearchParams::new())
            .await?;

        let mut index = TopicIndex::default();

        for stored in result.entries {
            match parse_topic(&stored.resource) {
                Ok(topic) => {
                    if index.by_url.contains_key(&topic.url) {
                        tracing::warn!(
                            id = %stored.id,
                            url = %topic.url,
                            "Duplicate SubscriptionTopic url, keeping the first"
                        );
                        continue;
                    }
                    for trigger in &topic.resource_triggers {
                        index
                            .by_type
                            .entry(trigger.resource_type.clone())
                            .or_default()
                            .insert(topic.url.clone());
                    }
                    index.by_url.insert(topic.url.clone(), topic);
                }
                Err(e) => {
                    tracing::warn!(
                        id = %stored.id,
                        error = %e,
                        "Rejected SubscriptionTopic, it will not match"
                    );
                }
            }
        }

        tracing::info!(count = index.by_url.len(), "Loaded subscription topics");

        *self.index.write() = index;
        Ok(())
    }

    pub fn topic_count(&self) -> usize {
        self.index.read().by_url.len()
    }

    /// Look up a topic by canonical url, any status.
    pub fn get(&self, url: &str) -> Option<Topic> {
        self.index.read().by_url.get(url).cloned()
    }

    /// Active topics with a trigger on `(resource_type, interaction)`.
    pub fn find_matching_topics(
        &self,
        resource_type: &str,
        interaction: TriggerInteraction,
    ) -> Vec<Topic> {
        let index = self.index.read();

        let Some(urls) = index.by_type.get(resource_type) else {
            return Vec::new();
        };

        let mut topics: Vec<Topic> = urls
            .iter()
            .filter_map(|url| index.by_url.get(url))
            .filter(|t| t.status == TopicStatus::Active && t.triggers_on(resource_type, interaction))
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.url.cmp(&b.url));
        topics
    }
}

/// Parse and validate a SubscriptionTopic resource.
///
/// Active topics need at least one trigger; every trigger must name a known
/// resource type and known interaction codes. A trigger without
/// `supportedInteraction` covers create, update and delete.
pub fn parse_topic(resource: &Value) -> SubscriptionResult<Topic> {
    let id = resource
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SubscriptionError::validation("SubscriptionTopic missing id"))?
        .to_string();

    let url = resource
        .get("url")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SubscriptionError::validation("SubscriptionTopic missing url"))?
        .to_string();

    let status_code = resource
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| SubscriptionError::validation("SubscriptionTopic missing status"))?;
    let status = TopicStatus::from_code(status_code).ok_or_else(|| {
        SubscriptionError::validation(format!("Unknown topic status: {status_code}"))
    })?;

    let title = resource
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);

    let resource_triggers = parse_resource_triggers(resource)?;

    if status == TopicStatus::Active && resource_triggers.is_empty() {
        return Err(SubscriptionError::validation(format!(
            "Active topic {url} has no resourceTrigger"
        )));
    }

    Ok(Topic {
        id,
        url,
        title,
        status,
        resource_triggers,
    })
}

fn parse_resource_triggers(resource: &Value) -> SubscriptionResult<Vec<ResourceTrigger>> {
    let triggers = resource
        .get("resourceTrigger")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut result = Vec::with_capacity(triggers.len());

    for trigger in triggers {
        let resource_type = trigger
            .get("resource")
            .and_then(Value::as_str)
            .ok_or_else(|| SubscriptionError::validation("resourceTrigger missing resource"))?;

        // Accept either a bare type or a canonical StructureDefinition url.
        let resource_type = resource_type.rsplit('/').next().unwrap_or(resource_type);
        if !is_known_resource_type(resource_type) {
            return Err(SubscriptionError::validation(format!(
                "Unknown resource type in trigger: {resource_type}"
            )));
        }

        let supported_interactions = match trigger
            .get("supportedInteraction")
            .and_then(Value::as_array)
        {
            Some(codes) => {
                let mut interactions = Vec::with_capacity(codes.len());
                for code in codes {
                    let code = code.as_str().unwrap_or_default();
                    let interaction = TriggerInteraction::from_code(code).ok_or_else(|| {
                        SubscriptionError::validation(format!("Unknown interaction: {code}"))
                    })?;
                    if !interactions.contains(&interaction) {
                        interactions.push(interaction);
                    }
                }
                interactions
            }
            None => TriggerInteraction::WRITES.to_vec(),
        };

        result.push(ResourceTrigger {
            resource_type: resource_type.to_string(),
            supported_interactions,
            fhirpath_criteria: trigger
                .get("fhirPathCriteria")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic_json(status: &str, triggers: Value) -> Value {
        json!({
            "resourceType": "SubscriptionTopic",
            "id": "t1",
            "url": "http://example.org/topics/obs",
            "status": status,
            "resourceTrigger": triggers
        })
    }

    #[test]
    fn parses_triggers() {
        let topic = parse_topic(&topic_json(
            "active",
            json!([{"resource": "Observation", "supportedInteraction": ["create", "update"]}]),
        ))
        .unwrap();

        assert_eq!(topic.status, TopicStatus::Active);
        assert!(topic.triggers_on("Observation", TriggerInteraction::Create));
        assert!(!topic.triggers_on("Observation", TriggerInteraction::Delete));
        assert!(!topic.triggers_on("Patient", TriggerInteraction::Create));
    }

    #[test]
    fn missing_interactions_default_to_all_writes() {
        let topic = parse_topic(&topic_json(
            "active",
            json!([{"resource": "http://hl7.org/fhir/StructureDefinition/Encounter"}]),
        ))
        .unwrap();

        assert_eq!(topic.resource_triggers[0].resource_type, "Encounter");
        for interaction in TriggerInteraction::WRITES {
            assert!(topic.triggers_on("Encounter", interaction));
        }
        assert!(!topic.triggers_on("Encounter", TriggerInteraction::Access));
    }

    #[test]
    fn rejects_invalid_topics() {
        assert!(parse_topic(&topic_json("active", json!([]))).is_err());
        assert!(parse_topic(&topic_json("active", json!([{"resource": "Bogus"}]))).is_err());
        assert!(
            parse_topic(&topic_json(
                "active",
                json!([{"resource": "Observation", "supportedInteraction": ["patch"]}])
            ))
            .is_err()
        );
        assert!(parse_topic(&topic_json("pending", json!([{"resource": "Observation"}]))).is_err());
    }

    #[test]
    fn draft_topic_may_have_no_triggers() {
        let topic = parse_topic(&topic_json("draft", json!([]))).unwrap();
        assert_eq!(topic.status, TopicStatus::Draft);
    }
}
