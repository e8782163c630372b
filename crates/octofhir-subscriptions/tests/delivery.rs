//! Delivery dispatcher and websocket channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use octofhir_core::events::{EventBroadcaster, HookSystemBuilder};
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::{DynStorage, EventedStorage, FhirStorage};
use octofhir_subscriptions::{
    ChannelRegistry, ChannelType, DeliveryChannel, DeliveryDispatcher, DeliveryJob,
    DeliveryOutcome, DeliverySettings, SessionEncoding, SessionMessage, SubscriptionChannel,
    SubscriptionEngine, SubscriptionError, SubscriptionResult, SubscriptionSettings,
    SubscriptionStatus, SubscriptionStore, TriggerInteraction,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const TOPIC_URL: &str = "http://example.org/topics/observation-create";

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn fast_settings() -> DeliverySettings {
    DeliverySettings {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        send_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn job(subscription_id: &str, resource_id: &str) -> DeliveryJob {
    DeliveryJob {
        subscription_id: subscription_id.to_string(),
        topic_url: TOPIC_URL.to_string(),
        channel_type: ChannelType::RestHook,
        resource_type: "Observation".to_string(),
        resource_id: resource_id.to_string(),
        interaction: TriggerInteraction::Create,
        attempt: 0,
    }
}

/// Channel that replays scripted outcomes, then succeeds.
#[derive(Default)]
struct ScriptedChannel {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    delay: Duration,
    sent: Mutex<Vec<(String, String)>>,
    in_flight: Mutex<Vec<String>>,
    overlap_same_subscription: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedChannel {
    fn with_script(outcomes: Vec<DeliveryOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn sent_for(&self, subscription_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(sub, _)| sub == subscription_id)
            .map(|(_, resource)| resource.clone())
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::RestHook
    }

    fn provision(&self, _channel: &SubscriptionChannel) -> SubscriptionResult<()> {
        Ok(())
    }

    async fn send(&self, job: &DeliveryJob) -> DeliveryOutcome {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains(&job.subscription_id) {
                self.overlap_same_subscription.fetch_add(1, Ordering::SeqCst);
            }
            in_flight.push(job.subscription_id.clone());
            self.max_in_flight.fetch_max(in_flight.len(), Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut in_flight = self.in_flight.lock();
            if let Some(pos) = in_flight.iter().position(|s| s == &job.subscription_id) {
                in_flight.remove(pos);
            }
        }

        self.sent
            .lock()
            .push((job.subscription_id.clone(), job.resource_id.clone()));
        self.script.lock().pop_front().unwrap_or(DeliveryOutcome::Delivered)
    }
}

fn start_dispatcher(
    channel: Arc<dyn DeliveryChannel>,
    storage: DynStorage,
) -> Arc<DeliveryDispatcher> {
    let (dispatcher, _router) = DeliveryDispatcher::start(
        ChannelRegistry::new().with(channel),
        Arc::new(SubscriptionStore::new(storage)),
        fast_settings(),
        CancellationToken::new(),
    );
    dispatcher
}

#[tokio::test]
async fn sends_are_serialized_per_subscription_and_keep_order() {
    let channel = Arc::new(ScriptedChannel::with_delay(Duration::from_millis(5)));
    let dispatcher = start_dispatcher(channel.clone(), Arc::new(InMemoryStorage::new()));

    for i in 0..10 {
        dispatcher.enqueue(job("a", &format!("o{i}"))).await;
        dispatcher.enqueue(job("b", &format!("o{i}"))).await;
    }

    assert!(eventually(|| dispatcher.stats().delivered == 20).await);

    let expected: Vec<String> = (0..10).map(|i| format!("o{i}")).collect();
    assert_eq!(channel.sent_for("a"), expected);
    assert_eq!(channel.sent_for("b"), expected);
    assert_eq!(channel.overlap_same_subscription.load(Ordering::SeqCst), 0);
    assert_eq!(channel.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.lane_count(), 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let channel = Arc::new(ScriptedChannel::with_script(vec![
        DeliveryOutcome::TransientFailure("busy".into()),
        DeliveryOutcome::TransientFailure("busy".into()),
    ]));
    let dispatcher = start_dispatcher(channel.clone(), Arc::new(InMemoryStorage::new()));

    dispatcher.enqueue(job("a", "o1")).await;

    assert!(eventually(|| dispatcher.stats().delivered == 1).await);
    let stats = dispatcher.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(channel.sent_for("a").len(), 3);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let channel = Arc::new(ScriptedChannel::with_script(vec![
        DeliveryOutcome::TransientFailure("busy".into());
        5
    ]));
    let dispatcher = start_dispatcher(channel.clone(), Arc::new(InMemoryStorage::new()));

    dispatcher.enqueue(job("a", "o1")).await;

    assert!(eventually(|| dispatcher.stats().failed == 1).await);
    assert_eq!(dispatcher.stats().retried, 2);
    assert_eq!(channel.sent_for("a").len(), 3);
}

#[tokio::test]
async fn permanent_failure_moves_subscription_to_error() {
    let storage: DynStorage = Arc::new(InMemoryStorage::new());
    storage
        .create(&json!({
            "resourceType": "Subscription",
            "id": "a",
            "status": "active",
            "topic": TOPIC_URL,
            "channelType": {"code": "rest-hook"},
            "endpoint": "https://example.org/hook"
        }))
        .await
        .unwrap();
    let store = SubscriptionStore::new(storage.clone());

    let channel = Arc::new(ScriptedChannel::with_script(vec![
        DeliveryOutcome::PermanentFailure("endpoint gone".into()),
    ]));
    let dispatcher = start_dispatcher(channel, storage);

    dispatcher.enqueue(job("a", "o1")).await;

    let mut record = None;
    for _ in 0..100 {
        let current = store.get("a").await.unwrap().unwrap();
        if current.status == SubscriptionStatus::Error {
            record = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.expect("subscription should move to error");
    assert_eq!(record.error.as_deref(), Some("endpoint gone"));
    assert_eq!(dispatcher.stats().retried, 0);
    assert!(eventually(|| dispatcher.lane_count() == 0).await);
}

#[tokio::test]
async fn tombstones_expire() {
    let channel = Arc::new(ScriptedChannel::default());
    let (dispatcher, _router) = DeliveryDispatcher::start(
        ChannelRegistry::new().with(channel.clone()),
        Arc::new(SubscriptionStore::new(Arc::new(InMemoryStorage::new()))),
        DeliverySettings {
            tombstone_ttl_ms: 0,
            ..fast_settings()
        },
        CancellationToken::new(),
    );

    dispatcher.cancel("a");
    assert!(dispatcher.is_cancelled("a"));

    // Each cancel sweeps expired tombstones first.
    dispatcher.cancel("b");
    assert!(!dispatcher.is_cancelled("a"));
    assert_eq!(dispatcher.cancelled_count(), 1);

    assert_eq!(dispatcher.prune_cancelled(), 1);
    assert_eq!(dispatcher.cancelled_count(), 0);

    // A live tombstone survives pruning.
    let long_lived = start_dispatcher(channel, Arc::new(InMemoryStorage::new()));
    long_lived.cancel("a");
    assert_eq!(long_lived.prune_cancelled(), 0);
    assert!(long_lived.is_cancelled("a"));
}

/// Blocks every send until released.
struct GatedChannel {
    started: Notify,
    release: Notify,
    sends: AtomicUsize,
}

#[async_trait]
impl DeliveryChannel for GatedChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::RestHook
    }

    fn provision(&self, _channel: &SubscriptionChannel) -> SubscriptionResult<()> {
        Ok(())
    }

    async fn send(&self, _job: &DeliveryJob) -> DeliveryOutcome {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        DeliveryOutcome::Delivered
    }
}

#[tokio::test]
async fn cancel_discards_queued_and_in_flight_jobs() {
    let channel = Arc::new(GatedChannel {
        started: Notify::new(),
        release: Notify::new(),
        sends: AtomicUsize::new(0),
    });
    let dispatcher = start_dispatcher(channel.clone(), Arc::new(InMemoryStorage::new()));

    for i in 0..3 {
        dispatcher.enqueue(job("a", &format!("o{i}"))).await;
    }
    channel.started.notified().await;

    dispatcher.cancel("a");
    dispatcher.cancel("a");
    channel.release.notify_waiters();

    assert!(eventually(|| dispatcher.stats().cancelled == 3).await);

    dispatcher.enqueue(job("a", "o4")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.cancelled, 4);
    assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Websocket channel through the full write feed
// ---------------------------------------------------------------------------

async fn wired_engine() -> (DynStorage, SubscriptionEngine) {
    let broadcaster = EventBroadcaster::new_shared();
    let storage: DynStorage = Arc::new(EventedStorage::new(
        InMemoryStorage::new(),
        broadcaster.clone(),
    ));
    let engine = SubscriptionEngine::start(storage.clone(), SubscriptionSettings::default());

    let mut builder = HookSystemBuilder::new();
    for hook in engine.hooks() {
        builder = builder.register(hook).await;
    }
    let _ = builder.start(broadcaster.subscribe());

    storage
        .create(&json!({
            "resourceType": "SubscriptionTopic",
            "id": "obs-create",
            "url": TOPIC_URL,
            "status": "active",
            "resourceTrigger": [{
                "resource": "Observation",
                "supportedInteraction": ["create"]
            }]
        }))
        .await
        .unwrap();
    storage
        .create(&json!({
            "resourceType": "Subscription",
            "id": "s1",
            "status": "requested",
            "topic": TOPIC_URL,
            "channelType": {"code": "websocket"},
            "contentType": "application/fhir+json"
        }))
        .await
        .unwrap();

    let mut active = false;
    for _ in 0..100 {
        if engine.store().get("s1").await.unwrap().unwrap().status == SubscriptionStatus::Active {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(active, "subscription never became active");

    (storage, engine)
}

#[tokio::test]
async fn observation_write_pings_bound_session() {
    let (storage, engine) = wired_engine().await;
    let (_handle, mut session) = engine
        .websocket()
        .register_session("s1", SessionEncoding::Json);

    storage
        .create(&json!({"resourceType": "Observation", "status": "final"}))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("ping within bounded wait");
    assert_eq!(
        message,
        Some(SessionMessage::Ping {
            subscription_id: "s1".to_string()
        })
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.try_recv().is_err(), "exactly one ping expected");

    // Updates are not part of the topic.
    let obs = storage
        .create(&json!({"resourceType": "Observation", "status": "preliminary"}))
        .await
        .unwrap();
    let _ = session.recv().await;
    storage
        .update(
            &json!({"resourceType": "Observation", "id": obs.id, "status": "final"}),
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.try_recv().is_err());

    engine.shutdown().await;
}

#[tokio::test]
async fn no_session_means_no_ping() {
    let (storage, engine) = wired_engine().await;

    storage
        .create(&json!({"resourceType": "Observation", "status": "final"}))
        .await
        .unwrap();

    assert!(eventually(|| engine.dispatcher().stats().dropped == 1).await);
    let stats = engine.dispatcher().stats();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.retried, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn deleted_subscription_gets_no_more_pings() {
    let (storage, engine) = wired_engine().await;
    let (_handle, mut session) = engine
        .websocket()
        .register_session("s1", SessionEncoding::Json);

    engine.delete_subscription("s1").await.unwrap();
    assert!(matches!(
        session.recv().await,
        Some(SessionMessage::Close { .. })
    ));

    storage
        .create(&json!({"resourceType": "Observation", "status": "final"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.dispatcher().stats().delivered, 0);
    assert!(engine.store().get("s1").await.unwrap().is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn sessions_bind_only_to_active_websocket_subscriptions() {
    let (_storage, engine) = wired_engine().await;

    let (handle, _session) = engine
        .bind_session("s1", SessionEncoding::Json)
        .await
        .unwrap();
    assert_eq!(handle.subscription_id, "s1");
    assert!(engine.websocket().has_session("s1"));

    engine.delete_subscription("s1").await.unwrap();
    assert_eq!(engine.websocket().session_count(), 0);

    let err = engine
        .bind_session("s1", SessionEncoding::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::SubscriptionNotFound(_)));
    assert_eq!(engine.websocket().session_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn turned_off_subscription_cannot_be_bound() {
    let (_storage, engine) = wired_engine().await;

    engine.lifecycle().deactivate("s1").await.unwrap();

    let err = engine
        .bind_session("s1", SessionEncoding::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::NotBindable(_)));
    assert!(err.to_string().contains("not active"));
    assert!(!engine.websocket().has_session("s1"));

    engine.shutdown().await;
}
