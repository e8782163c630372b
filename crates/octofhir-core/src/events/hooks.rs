use async_trait::async_trait;

use super::types::{ResourceEvent, ResourceEventType};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook execution failed: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl HookError {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Consumer of the write feed.
///
/// `handle` is awaited before the dispatcher moves to the next event, so an
/// implementation that does slow work should hand it off to its own queue.
#[async_trait]
pub trait ResourceHook: Send + Sync {
    fn name(&self) -> &str;

    /// Resource types of interest; empty means all.
    fn resource_types(&self) -> &[&str];

    /// Write kinds of interest; empty means all.
    fn event_types(&self) -> &[ResourceEventType] {
        &[]
    }

    async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError>;

    async fn on_start(&self) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn matches(&self, event: &ResourceEvent) -> bool {
        let types = self.resource_types();
        let kinds = self.event_types();
        (types.is_empty() || types.contains(&event.resource_type.as_str()))
            && (kinds.is_empty() || kinds.contains(&event.event_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Filter {
        types: &'static [&'static str],
        kinds: &'static [ResourceEventType],
    }

    #[async_trait]
    impl ResourceHook for Filter {
        fn name(&self) -> &str {
            "filter"
        }

        fn resource_types(&self) -> &[&str] {
            self.types
        }

        fn event_types(&self) -> &[ResourceEventType] {
            self.kinds
        }

        async fn handle(&self, _event: &ResourceEvent) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[test]
    fn filters_by_resource_type() {
        let hook = Filter {
            types: &["Subscription", "SubscriptionTopic"],
            kinds: &[],
        };
        assert!(hook.matches(&ResourceEvent::created("Subscription", "1", json!({}))));
        assert!(hook.matches(&ResourceEvent::deleted("SubscriptionTopic", "2")));
        assert!(!hook.matches(&ResourceEvent::created("Observation", "3", json!({}))));
    }

    #[test]
    fn filters_by_kind() {
        let hook = Filter {
            types: &[],
            kinds: &[ResourceEventType::Deleted],
        };
        assert!(hook.matches(&ResourceEvent::deleted("Encounter", "3")));
        assert!(!hook.matches(&ResourceEvent::updated("Encounter", "3", json!({}))));
    }
}
