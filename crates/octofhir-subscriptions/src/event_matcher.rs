//! Event Matcher.
//!
//! Turns one write-feed event into delivery jobs: active topics triggering on
//! the event's `(resource type, interaction)`, then active subscriptions bound
//! to each topic, then every registered [`MatchPredicate`]. The matcher holds
//! no mutable state; concurrent calls are independent.

use std::sync::Arc;

use octofhir_core::events::ResourceEvent;
use time::OffsetDateTime;

use crate::subscription_store::SubscriptionStore;
use crate::topic_registry::TopicRegistry;
use crate::types::{DeliveryJob, SubscriptionRecord, Topic, TriggerInteraction};

/// Everything a predicate may look at.
pub struct MatchContext<'a> {
    pub event: &'a ResourceEvent,
    pub interaction: TriggerInteraction,
    pub topic: &'a Topic,
    pub subscription: &'a SubscriptionRecord,
    pub now: OffsetDateTime,
}

/// Extra filter applied after the structural type and interaction match.
pub trait MatchPredicate: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, ctx: &MatchContext<'_>) -> bool;
}

/// Rejects subscriptions whose `end` instant has passed.
pub struct EndTimePredicate;

impl MatchPredicate for EndTimePredicate {
    fn name(&self) -> &str {
        "end-time"
    }

    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.subscription.end.is_none_or(|end| end > ctx.now)
    }
}

pub struct EventMatcher {
    topics: Arc<TopicRegistry>,
    store: Arc<SubscriptionStore>,
    predicates: Vec<Arc<dyn MatchPredicate>>,
}

impl EventMatcher {
    /// Matcher with the built-in [`EndTimePredicate`].
    pub fn new(topics: Arc<TopicRegistry>, store: Arc<SubscriptionStore>) -> Self {
        Self {
            topics,
            store,
            predicates: vec![Arc::new(EndTimePredicate)],
        }
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn MatchPredicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// One job per (matching topic, active subscription) pair.
    ///
    /// A subscription store error for one topic is logged and that topic is
    /// skipped; the others are still matched.
    pub async fn match_event(&self, event: &ResourceEvent) -> Vec<DeliveryJob> {
        let interaction = TriggerInteraction::from(event.event_type);

        let topics = self
            .topics
            .find_matching_topics(&event.resource_type, interaction);

        if topics.is_empty() {
            tracing::trace!(
                resource_type = %event.resource_type,
                interaction = interaction.as_str(),
                "No matching subscription topics"
            );
            return Vec::new();
        }

        let now = OffsetDateTime::now_utc();
        let mut jobs = Vec::new();

        for topic in &topics {
            let subscriptions = match self.store.find_active_for_topic(&topic.url).await {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    tracing::warn!(
                        topic_url = %topic.url,
                        error = %e,
                        "Failed to load subscriptions for topic, skipping"
                    );
                    continue;
                }
            };

            for subscription in &subscriptions {
                let ctx = MatchContext {
                    event,
                    interaction,
                    topic,
                    subscription,
                    now,
                };

                if let Some(rejected) = self.predicates.iter().find(|p| !p.matches(&ctx)) {
                    tracing::trace!(
                        subscription_id = %subscription.id,
                        predicate = rejected.name(),
                        "Subscription filtered out"
                    );
                    continue;
                }

                jobs.push(DeliveryJob {
                    subscription_id: subscription.id.clone(),
                    topic_url: topic.url.clone(),
                    channel_type: subscription.channel.channel_type.clone(),
                    resource_type: event.resource_type.clone(),
                    resource_id: event.resource_id.clone(),
                    interaction,
                    attempt: 0,
                });
            }
        }

        tracing::debug!(
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            interaction = interaction.as_str(),
            topics = topics.len(),
            jobs = jobs.len(),
            "Matched write event"
        );

        jobs
    }
}
