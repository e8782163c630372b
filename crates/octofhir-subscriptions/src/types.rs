//! Core types for topic-based subscriptions.
//!
//! These are the parsed, validated forms of the stored `SubscriptionTopic`
//! and `Subscription` resources, plus the ephemeral delivery types.

use std::fmt;

use octofhir_core::events::ResourceEventType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

// =============================================================================
// TOPIC TYPES
// =============================================================================

/// Parsed SubscriptionTopic.
#[derive(Debug, Clone)]
pub struct Topic {
    /// Resource ID of the stored topic.
    pub id: String,

    /// Canonical URL, the key subscriptions refer to.
    pub url: String,

    pub title: Option<String>,

    pub status: TopicStatus,

    /// Ordered resource triggers.
    pub resource_triggers: Vec<ResourceTrigger>,
}

impl Topic {
    /// True when some trigger covers `(resource_type, interaction)`.
    pub fn triggers_on(&self, resource_type: &str, interaction: TriggerInteraction) -> bool {
        self.resource_triggers.iter().any(|t| {
            t.resource_type == resource_type && t.supported_interactions.contains(&interaction)
        })
    }
}

/// Status of a subscription topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Draft,
    Active,
    Retired,
}

impl TopicStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }
}

/// Which resource writes a topic is interested in.
#[derive(Debug, Clone)]
pub struct ResourceTrigger {
    /// FHIR resource type (e.g., "Observation").
    pub resource_type: String,

    pub supported_interactions: Vec<TriggerInteraction>,

    /// Kept verbatim for future predicates; not evaluated.
    pub fhirpath_criteria: Option<String>,
}

/// Interactions that can trigger a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerInteraction {
    Create,
    Update,
    Delete,
    /// Accepted in topic definitions; the write feed never produces it.
    Access,
}

impl TriggerInteraction {
    pub const WRITES: [TriggerInteraction; 3] = [Self::Create, Self::Update, Self::Delete];

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "access" => Some(Self::Access),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Access => "access",
        }
    }
}

impl From<ResourceEventType> for TriggerInteraction {
    fn from(event_type: ResourceEventType) -> Self {
        match event_type {
            ResourceEventType::Created => Self::Create,
            ResourceEventType::Updated => Self::Update,
            ResourceEventType::Deleted => Self::Delete,
        }
    }
}

// =============================================================================
// SUBSCRIPTION TYPES
// =============================================================================

/// Parsed Subscription record.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: String,

    /// Version the record was read at; the compare-and-set token.
    pub version_id: String,

    /// Canonical URL of the referenced topic.
    pub topic_url: String,

    pub status: SubscriptionStatus,

    pub channel: SubscriptionChannel,

    /// Free text supplied by the client.
    pub reason: Option<String>,

    /// Failure text recorded by the lifecycle.
    pub error: Option<String>,

    /// After this instant the subscription receives no notifications.
    pub end: Option<OffsetDateTime>,

    pub created_at: OffsetDateTime,

    /// Raw stored body, written back on status transitions.
    pub resource: Value,
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Created, waiting for the lifecycle to activate it.
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }

    /// Legal edges of the lifecycle state machine. Nothing re-enters
    /// `requested` and `off` is terminal.
    pub fn can_transition_to(self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, to),
            (Requested, Active) | (Requested, Error) | (Active, Off) | (Error, Off) | (Active, Error)
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChannel {
    pub channel_type: ChannelType,
    pub endpoint: Option<String>,
    pub content_type: String,
}

/// Channel type code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelType {
    WebSocket,
    RestHook,
    Email,
    Message,
    Other(String),
}

impl ChannelType {
    pub fn from_code(code: &str) -> Self {
        match code {
            "websocket" => Self::WebSocket,
            "rest-hook" => Self::RestHook,
            "email" => Self::Email,
            "message" => Self::Message,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::WebSocket => "websocket",
            Self::RestHook => "rest-hook",
            Self::Email => "email",
            Self::Message => "message",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DELIVERY TYPES
// =============================================================================

/// One attempt to notify one subscription of one matched write. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub subscription_id: String,
    pub topic_url: String,
    pub channel_type: ChannelType,
    pub resource_type: String,
    pub resource_id: String,
    pub interaction: TriggerInteraction,
    /// Attempts made so far.
    pub attempt: u32,
}

/// Result of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Nothing to deliver to (e.g. no live websocket session). Not retried.
    Dropped(String),
    TransientFailure(String),
    PermanentFailure(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn lifecycle_edges() {
        assert!(Requested.can_transition_to(Active));
        assert!(Requested.can_transition_to(Error));
        assert!(Active.can_transition_to(Off));
        assert!(Error.can_transition_to(Off));
        assert!(Active.can_transition_to(Error));

        for from in [Requested, Active, Error, Off] {
            assert!(!from.can_transition_to(Requested));
        }
        for to in [Requested, Active, Error] {
            assert!(!Off.can_transition_to(to));
        }
        assert!(!Requested.can_transition_to(Off));
        assert!(!Error.can_transition_to(Active));
    }

    #[test]
    fn codes_round_trip() {
        for s in [Requested, Active, Error, Off] {
            assert_eq!(SubscriptionStatus::from_code(s.as_str()), Some(s));
        }
        assert_eq!(SubscriptionStatus::from_code("entered-in-error"), None);
        assert_eq!(TriggerInteraction::from_code("patch"), None);
        assert_eq!(
            ChannelType::from_code("sms"),
            ChannelType::Other("sms".to_string())
        );
    }

    #[test]
    fn interaction_from_event_type() {
        assert_eq!(
            TriggerInteraction::from(ResourceEventType::Created),
            TriggerInteraction::Create
        );
        assert_eq!(
            TriggerInteraction::from(ResourceEventType::Deleted),
            TriggerInteraction::Delete
        );
    }
}
