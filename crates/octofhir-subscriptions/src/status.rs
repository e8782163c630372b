//! `SubscriptionStatus` view for the status polling contract.

use octofhir_storage::StoredResource;
use serde_json::{Value, json};

use crate::types::{SubscriptionRecord, SubscriptionStatus};

/// Render a `query-status` SubscriptionStatus for a record.
pub fn status_view(record: &SubscriptionRecord) -> Value {
    render(
        &record.id,
        record.status.as_str(),
        Some(&record.topic_url),
        record.error.as_deref(),
    )
}

/// Status view straight from the stored body, for records that do not parse.
pub fn raw_status_view(stored: &StoredResource) -> Value {
    let resource = &stored.resource;
    render(
        &stored.id,
        text(resource, "status").unwrap_or(SubscriptionStatus::Requested.as_str()),
        text(resource, "topic").or_else(|| text(resource, "criteria")),
        text(resource, "error"),
    )
}

fn text<'a>(resource: &'a Value, key: &str) -> Option<&'a str> {
    resource.get(key).and_then(Value::as_str)
}

fn render(id: &str, status: &str, topic: Option<&str>, error: Option<&str>) -> Value {
    let mut view = json!({
        "resourceType": "SubscriptionStatus",
        "id": format!("{id}-status"),
        "status": status,
        "type": "query-status",
        "subscription": {
            "reference": format!("Subscription/{id}")
        },
    });

    if let Some(topic) = topic {
        view["topic"] = json!(topic);
    }
    if let Some(error) = error {
        view["error"] = json!([{ "text": error }]);
    }

    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription_store::parse_subscription;

    #[test]
    fn renders_error_text() {
        let stored = StoredResource::new(
            "s1",
            "4",
            "Subscription",
            json!({
                "resourceType": "Subscription",
                "id": "s1",
                "status": "error",
                "topic": "http://example.org/t",
                "channelType": {"code": "websocket"},
                "error": "Topic not found: http://example.org/t"
            }),
        );
        let view = status_view(&parse_subscription(&stored).unwrap());

        assert_eq!(view["status"], "error");
        assert_eq!(view["type"], "query-status");
        assert_eq!(view["subscription"]["reference"], "Subscription/s1");
        assert_eq!(view["error"][0]["text"], "Topic not found: http://example.org/t");
    }

    #[test]
    fn unparseable_record_still_has_a_view() {
        let stored = StoredResource::new(
            "bad",
            "2",
            "Subscription",
            json!({
                "resourceType": "Subscription",
                "id": "bad",
                "status": "error",
                "topic": "http://example.org/t",
                "error": "Validation error: Subscription missing channel type"
            }),
        );
        let view = raw_status_view(&stored);

        assert_eq!(view["status"], "error");
        assert_eq!(view["topic"], "http://example.org/t");
        assert_eq!(view["subscription"]["reference"], "Subscription/bad");
        assert!(view["error"][0]["text"].as_str().unwrap().contains("channel type"));
    }
}
