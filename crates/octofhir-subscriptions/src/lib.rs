//! Topic-based subscription engine.
//!
//! ```text
//!  storage write ──► EventBroadcaster ──► HookDispatcher
//!                                          │
//!              ┌───────────────────────────┴──────────────────────┐
//!              ▼                                                  ▼
//!       SubscriptionHook                                   LifecycleHook
//!   (EventMatcher: topics ×                    (topic reload, evaluate requested
//!    active subscriptions)                      subscriptions, cancel on delete)
//!              │                                                  │
//!              ▼                                                  ▼
//!     DeliveryDispatcher queue ──► per-subscription lane ──► DeliveryChannel
//!                                                          (WebSocketChannel ──► session)
//! ```
//!
//! Topics and subscriptions live in the resource store like any other
//! resource. The [`TopicRegistry`] keeps an in-memory index of topics; the
//! [`SubscriptionStore`] reads subscriptions on demand and performs
//! compare-and-set status transitions.

pub mod config;
pub mod delivery;
pub mod error;
pub mod event_matcher;
pub mod hook;
pub mod lifecycle;
pub mod status;
pub mod subscription_store;
pub mod topic_registry;
pub mod types;

pub use config::{DeliverySettings, SubscriptionSettings};
pub use delivery::{
    ChannelRegistry, DeliveryChannel, DeliveryDispatcher, DeliveryStatsSnapshot, SessionEncoding,
    SessionHandle, SessionMessage, WebSocketChannel, WebSocketRegistry,
};
pub use error::{SubscriptionError, SubscriptionResult};
pub use event_matcher::{EndTimePredicate, EventMatcher, MatchContext, MatchPredicate};
pub use hook::{LifecycleHook, SubscriptionHook};
pub use lifecycle::LifecycleManager;
pub use status::{raw_status_view, status_view};
pub use subscription_store::{SubscriptionStore, validate_subscription};
pub use topic_registry::TopicRegistry;
pub use types::{
    ChannelType, DeliveryJob, DeliveryOutcome, SubscriptionChannel, SubscriptionRecord,
    SubscriptionStatus, Topic, TopicStatus, TriggerInteraction,
};

use std::sync::Arc;

use octofhir_core::events::ResourceHook;
use octofhir_storage::DynStorage;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fully wired engine: registry, store, lifecycle, matcher and dispatcher
/// sharing one storage backend.
pub struct SubscriptionEngine {
    settings: SubscriptionSettings,
    topics: Arc<TopicRegistry>,
    store: Arc<SubscriptionStore>,
    websocket: Arc<WebSocketRegistry>,
    dispatcher: Arc<DeliveryDispatcher>,
    lifecycle: Arc<LifecycleManager>,
    matcher: Arc<EventMatcher>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    /// Build the engine with the built-in websocket channel.
    ///
    /// Must be called inside a tokio runtime; the dispatcher router is
    /// spawned immediately.
    pub fn start(storage: DynStorage, settings: SubscriptionSettings) -> Self {
        let websocket = Arc::new(WebSocketRegistry::new());
        let channels = ChannelRegistry::new().with(Arc::new(WebSocketChannel::new(websocket.clone())));
        Self::with_channels(storage, settings, channels, websocket)
    }

    /// Build the engine with a caller-supplied channel set.
    pub fn with_channels(
        storage: DynStorage,
        settings: SubscriptionSettings,
        channels: ChannelRegistry,
        websocket: Arc<WebSocketRegistry>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let topics = Arc::new(TopicRegistry::new(storage.clone()));
        let store = Arc::new(SubscriptionStore::new(storage));

        let (dispatcher, router) = DeliveryDispatcher::start(
            channels.clone(),
            store.clone(),
            settings.delivery.clone(),
            shutdown.child_token(),
        );

        let lifecycle = Arc::new(LifecycleManager::new(
            topics.clone(),
            store.clone(),
            channels,
            dispatcher.clone(),
            websocket.clone(),
            settings.activation_timeout(),
        ));
        let matcher = Arc::new(EventMatcher::new(topics.clone(), store.clone()));

        tracing::info!(
            enabled = settings.enabled,
            websocket_enabled = settings.websocket_enabled,
            "Subscription engine initialized"
        );

        Self {
            settings,
            topics,
            store,
            websocket,
            dispatcher,
            lifecycle,
            matcher,
            shutdown,
            tasks: Mutex::new(vec![router]),
        }
    }

    /// Hooks to register with the write-feed dispatcher.
    pub fn hooks(&self) -> Vec<Arc<dyn ResourceHook>> {
        vec![
            Arc::new(LifecycleHook::new(
                self.topics.clone(),
                self.lifecycle.clone(),
                self.dispatcher.clone(),
            )),
            Arc::new(SubscriptionHook::new(
                self.matcher.clone(),
                self.dispatcher.clone(),
                self.settings.enabled,
            )),
        ]
    }

    /// Spawn the bounded-interval re-evaluation of `requested` subscriptions.
    pub fn start_background(&self) {
        let task = tokio::spawn(
            self.lifecycle
                .clone()
                .run(self.settings.reevaluate_interval(), self.shutdown.child_token()),
        );
        self.tasks.lock().push(task);
    }

    /// Current `SubscriptionStatus` view, or `None` for an unknown id.
    ///
    /// A record that does not parse is rendered from its stored fields.
    pub async fn status_view(&self, id: &str) -> SubscriptionResult<Option<Value>> {
        match self.store.get(id).await {
            Ok(record) => Ok(record.as_ref().map(status_view)),
            Err(SubscriptionError::Validation(_)) => {
                Ok(self.store.read_raw(id).await?.as_ref().map(raw_status_view))
            }
            Err(e) => Err(e),
        }
    }

    /// Turn a subscription off, cancel its jobs and purge the record.
    pub async fn delete_subscription(&self, id: &str) -> SubscriptionResult<()> {
        self.lifecycle.deactivate(id).await?;
        self.store.purge(id).await?;
        // An activation that landed before the purge may have lifted the
        // tombstone.
        self.dispatcher.cancel(id);
        Ok(())
    }

    /// Bind a websocket session to a subscription.
    ///
    /// The subscription must exist, be `active` and use the websocket
    /// channel. The check runs again once the session is registered, so a
    /// subscription turned off while binding never keeps a session.
    pub async fn bind_session(
        &self,
        id: &str,
        encoding: SessionEncoding,
    ) -> SubscriptionResult<(SessionHandle, mpsc::Receiver<SessionMessage>)> {
        self.check_bindable(id).await?;
        let (handle, receiver) = self.websocket.register_session(id, encoding);
        if let Err(e) = self.check_bindable(id).await {
            self.websocket.on_session_closed(&handle);
            return Err(e);
        }
        Ok((handle, receiver))
    }

    async fn check_bindable(&self, id: &str) -> SubscriptionResult<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.to_string()))?;

        if record.status != SubscriptionStatus::Active {
            return Err(SubscriptionError::NotBindable(format!(
                "subscription {id} is {}, not active",
                record.status
            )));
        }
        if record.channel.channel_type != ChannelType::WebSocket {
            return Err(SubscriptionError::NotBindable(format!(
                "subscription {id} does not use the websocket channel"
            )));
        }
        Ok(())
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<DeliveryDispatcher> {
        &self.dispatcher
    }

    pub fn websocket(&self) -> &Arc<WebSocketRegistry> {
        &self.websocket
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Subscription background task failed");
            }
        }
        tracing::info!("Subscription engine stopped");
    }
}
