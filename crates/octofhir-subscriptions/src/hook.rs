//! Write-feed hooks.
//!
//! [`SubscriptionHook`] feeds domain writes to the matcher and queues the
//! resulting jobs. [`LifecycleHook`] reacts to topic and subscription writes
//! by re-evaluating activation; a topic write reloads the topic index first.

use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::events::{HookError, ResourceEvent, ResourceEventType, ResourceHook};

use crate::delivery::DeliveryDispatcher;
use crate::event_matcher::EventMatcher;
use crate::lifecycle::LifecycleManager;
use crate::topic_registry::TopicRegistry;

/// Resource types whose writes never trigger notifications.
const ENGINE_RESOURCES: [&str; 3] = ["Subscription", "SubscriptionTopic", "SubscriptionStatus"];

pub struct SubscriptionHook {
    matcher: Arc<EventMatcher>,
    dispatcher: Arc<DeliveryDispatcher>,
    enabled: bool,
}

impl SubscriptionHook {
    pub fn new(
        matcher: Arc<EventMatcher>,
        dispatcher: Arc<DeliveryDispatcher>,
        enabled: bool,
    ) -> Self {
        Self {
            matcher,
            dispatcher,
            enabled,
        }
    }
}

#[async_trait]
impl ResourceHook for SubscriptionHook {
    fn name(&self) -> &str {
        "subscription_matcher"
    }

    fn resource_types(&self) -> &[&str] {
        &[]
    }

    async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError> {
        if !self.enabled || ENGINE_RESOURCES.contains(&event.resource_type.as_str()) {
            return Ok(());
        }

        for job in self.matcher.match_event(event).await {
            self.dispatcher.enqueue(job).await;
        }

        Ok(())
    }

    async fn on_start(&self) -> Result<(), HookError> {
        if !self.enabled {
            tracing::info!("Subscription matching disabled");
        }
        Ok(())
    }
}

pub struct LifecycleHook {
    topics: Arc<TopicRegistry>,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Arc<DeliveryDispatcher>,
}

impl LifecycleHook {
    pub fn new(
        topics: Arc<TopicRegistry>,
        lifecycle: Arc<LifecycleManager>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self {
            topics,
            lifecycle,
            dispatcher,
        }
    }
}

#[async_trait]
impl ResourceHook for LifecycleHook {
    fn name(&self) -> &str {
        "subscription_lifecycle"
    }

    fn resource_types(&self) -> &[&str] {
        &["Subscription", "SubscriptionTopic"]
    }

    async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError> {
        match (event.resource_type.as_str(), event.event_type) {
            ("SubscriptionTopic", _) => {
                self.lifecycle.reevaluate_pending().await;
            }
            ("Subscription", ResourceEventType::Deleted) => {
                self.dispatcher.cancel(&event.resource_id);
            }
            ("Subscription", _) => {
                self.lifecycle
                    .evaluate(&event.resource_id)
                    .await
                    .map_err(|e| HookError::execution(e.to_string()))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_start(&self) -> Result<(), HookError> {
        self.topics
            .reload()
            .await
            .map_err(|e| HookError::storage(format!("Failed to load subscription topics: {e}")))?;
        self.lifecycle.reevaluate_pending().await;

        tracing::info!(
            topic_count = self.topics.topic_count(),
            "Subscription lifecycle hook started"
        );
        Ok(())
    }
}
