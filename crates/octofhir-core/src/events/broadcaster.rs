use std::sync::Arc;

use tokio::sync::broadcast;

use super::types::ResourceEvent;

/// Receivers that fall further behind than this lose the oldest events.
const DEFAULT_CAPACITY: usize = 1024;

/// Publishing side of the write feed.
///
/// ```
/// use octofhir_core::events::{EventBroadcaster, ResourceEvent};
///
/// let feed = EventBroadcaster::new();
/// let mut rx = feed.subscribe();
/// feed.send(ResourceEvent::deleted("Patient", "123"));
/// assert_eq!(rx.try_recv().unwrap().resource_id, "123");
/// ```
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ResourceEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish `event`; returns how many receivers got it.
    pub fn send(&self, event: ResourceEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receivers only see events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("receivers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ResourceEventType;
    use serde_json::json;

    #[test]
    fn nobody_listening_is_not_an_error() {
        let feed = EventBroadcaster::new();
        assert!(!feed.has_subscribers());
        assert_eq!(feed.send(ResourceEvent::deleted("Patient", "1")), 0);
    }

    #[tokio::test]
    async fn receivers_see_sends_in_order() {
        let feed = EventBroadcaster::new();
        let mut rx = feed.subscribe();
        feed.send(ResourceEvent::created("Observation", "1", json!({})));
        feed.send(ResourceEvent::updated("Observation", "1", json!({})));

        assert_eq!(rx.recv().await.unwrap().event_type, ResourceEventType::Created);
        assert_eq!(rx.recv().await.unwrap().event_type, ResourceEventType::Updated);
    }

    #[tokio::test]
    async fn lagging_receiver_skips_to_newest() {
        let feed = EventBroadcaster::with_capacity(2);
        let mut rx = feed.subscribe();
        for i in 0..4 {
            feed.send(ResourceEvent::created("Observation", i.to_string(), json!({})));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert_eq!(missed, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().resource_id, "2");
    }
}
