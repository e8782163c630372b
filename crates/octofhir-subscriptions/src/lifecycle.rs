//! Subscription Lifecycle State Machine.
//!
//! ```text
//! requested --topic active, channel provisioned--> active --delete--> off
//!     \--topic retired / missing past timeout / bad channel / malformed--> error --delete--> off
//! active --permanent delivery failure / binding changed to an invalid one--> error
//! ```
//!
//! Activation is asynchronous: `evaluate` runs when a subscription or topic
//! is written and on a bounded interval, which also reloads the topics.
//! Every transition is a compare-and-set on the record version, so
//! concurrent evaluators cannot both activate the same subscription.
//! Failures are recorded on the record (`status = error`, `error` text),
//! never returned to a client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::delivery::{ChannelRegistry, DeliveryDispatcher, WebSocketRegistry};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::subscription_store::SubscriptionStore;
use crate::topic_registry::TopicRegistry;
use crate::types::{SubscriptionRecord, SubscriptionStatus, TopicStatus};

/// What evaluation decided for a subscription's binding.
enum Verdict {
    Activate,
    Fail(String),
    Wait,
}

pub struct LifecycleManager {
    topics: Arc<TopicRegistry>,
    store: Arc<SubscriptionStore>,
    channels: ChannelRegistry,
    dispatcher: Arc<DeliveryDispatcher>,
    websocket: Arc<WebSocketRegistry>,
    activation_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        topics: Arc<TopicRegistry>,
        store: Arc<SubscriptionStore>,
        channels: ChannelRegistry,
        dispatcher: Arc<DeliveryDispatcher>,
        websocket: Arc<WebSocketRegistry>,
        activation_timeout: Duration,
    ) -> Self {
        Self {
            topics,
            store,
            channels,
            dispatcher,
            websocket,
            activation_timeout,
        }
    }

    /// Try to move a `requested` subscription forward.
    ///
    /// Returns the status after evaluation, or `None` if the subscription
    /// does not exist. Losing a compare-and-set race is not an error; the
    /// winner's status is returned. A `requested` record that does not parse
    /// goes to `error` with the parse failure as its text.
    pub async fn evaluate(&self, id: &str) -> SubscriptionResult<Option<SubscriptionStatus>> {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(SubscriptionError::Validation(reason)) => {
                return self.fail_malformed(id, reason).await;
            }
            Err(e) => return Err(e),
        };

        if record.status != SubscriptionStatus::Requested {
            return Ok(Some(record.status));
        }

        let (to, error) = match self.verdict(&record, true) {
            Verdict::Wait => return Ok(Some(SubscriptionStatus::Requested)),
            Verdict::Activate => (SubscriptionStatus::Active, None),
            Verdict::Fail(reason) => (SubscriptionStatus::Error, Some(reason)),
        };

        match self
            .store
            .compare_and_set_status(&record, to, error.as_deref())
            .await
        {
            Ok(updated) => {
                if let Some(reason) = &error {
                    tracing::warn!(
                        subscription_id = %record.id,
                        reason = %reason,
                        "Subscription activation failed"
                    );
                }
                if updated.status == SubscriptionStatus::Active {
                    self.lift_tombstone(id).await;
                }
                Ok(Some(updated.status))
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(subscription_id = %id, "Activation raced another writer");
                Ok(self.store.get(id).await?.map(|r| r.status))
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_malformed(
        &self,
        id: &str,
        reason: String,
    ) -> SubscriptionResult<Option<SubscriptionStatus>> {
        if self.store.fail_unparseable(id, &reason).await? {
            tracing::warn!(
                subscription_id = %id,
                reason = %reason,
                "Malformed subscription moved to error"
            );
            return Ok(Some(SubscriptionStatus::Error));
        }

        let Some(stored) = self.store.read_raw(id).await? else {
            return Ok(None);
        };
        match stored
            .resource
            .get("status")
            .and_then(Value::as_str)
            .and_then(SubscriptionStatus::from_code)
        {
            Some(status) if status != SubscriptionStatus::Requested => Ok(Some(status)),
            _ => Err(SubscriptionError::Validation(reason)),
        }
    }

    /// A reused id may still carry the tombstone of its previous incarnation.
    /// Lift it, then put it back if the subscription stopped being active in
    /// the meantime.
    async fn lift_tombstone(&self, id: &str) {
        if !self.dispatcher.reinstate(id) {
            return;
        }
        let still_active = matches!(
            self.store.get(id).await,
            Ok(Some(record)) if record.status == SubscriptionStatus::Active
        );
        if !still_active {
            self.dispatcher.cancel(id);
        }
    }

    /// Decide what a subscription's binding allows. With `patient`, a topic
    /// that is missing or not yet active is waited for until the activation
    /// timeout.
    fn verdict(&self, record: &SubscriptionRecord, patient: bool) -> Verdict {
        match self.topics.get(&record.topic_url) {
            Some(topic) if topic.status == TopicStatus::Active => {}
            Some(topic) if topic.status == TopicStatus::Retired => {
                return Verdict::Fail(format!("Topic {} is retired", topic.url));
            }
            found => {
                let waited = OffsetDateTime::now_utc() - record.created_at;
                if patient && waited < self.activation_timeout {
                    return Verdict::Wait;
                }
                return Verdict::Fail(match found {
                    Some(_) => format!("Topic {} is not active", record.topic_url),
                    None => format!("Topic not found: {}", record.topic_url),
                });
            }
        }

        let Some(channel) = self.channels.get(&record.channel.channel_type) else {
            return Verdict::Fail(format!(
                "Unsupported channel type: {}",
                record.channel.channel_type
            ));
        };

        match channel.provision(&record.channel) {
            Ok(()) => Verdict::Activate,
            Err(e) => Verdict::Fail(e.to_string()),
        }
    }

    /// Re-check a subscription after a client changed its body.
    ///
    /// A `requested` record is evaluated as usual. An `active` record whose
    /// topic or channel no longer checks out moves to `error` and loses its
    /// websocket session.
    pub async fn revalidate(&self, id: &str) -> SubscriptionResult<Option<SubscriptionStatus>> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(None);
        };

        match record.status {
            SubscriptionStatus::Requested => return self.evaluate(id).await,
            SubscriptionStatus::Active => {}
            other => return Ok(Some(other)),
        }

        let reason = match self.verdict(&record, false) {
            Verdict::Fail(reason) => reason,
            Verdict::Activate | Verdict::Wait => return Ok(Some(SubscriptionStatus::Active)),
        };

        match self
            .store
            .compare_and_set_status(&record, SubscriptionStatus::Error, Some(&reason))
            .await
        {
            Ok(updated) => {
                tracing::warn!(
                    subscription_id = %id,
                    reason = %reason,
                    "Active subscription no longer valid"
                );
                self.websocket.close_subscription(id, &reason);
                Ok(Some(updated.status))
            }
            Err(e) if e.is_conflict() => Ok(self.store.get(id).await?.map(|r| r.status)),
            Err(e) => Err(e),
        }
    }

    /// Reload topics, then evaluate every `requested` subscription.
    ///
    /// The reload keeps the topic index current even when a topic write
    /// never reached the write feed. Errors are logged per record.
    pub async fn reevaluate_pending(&self) {
        if let Err(e) = self.topics.reload().await {
            tracing::error!(
                error = %e,
                "Failed to reload subscription topics, keeping the previous index"
            );
        }

        let pending = match self.store.ids_by_status(SubscriptionStatus::Requested).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list requested subscriptions");
                return;
            }
        };

        for id in pending {
            if let Err(e) = self.evaluate(&id).await {
                tracing::warn!(
                    subscription_id = %id,
                    error = %e,
                    "Subscription evaluation failed"
                );
            }
        }
    }

    /// Turn a subscription off and cancel its deliveries. Idempotent.
    ///
    /// `active` and `error` go to `off`. A `requested` subscription has no
    /// outgoing edge to `off`; its deliveries are cancelled and the caller
    /// purges it. A record that does not parse is left for the caller to
    /// purge as well.
    pub async fn deactivate(&self, id: &str) -> SubscriptionResult<()> {
        self.dispatcher.cancel(id);
        let result = self.turn_off(id).await;
        // After the status change: a concurrent bind either sees `off` or is
        // closed here, and an activation that lifted the first tombstone
        // loses it again.
        self.websocket.close_subscription(id, "subscription turned off");
        self.dispatcher.cancel(id);
        result
    }

    async fn turn_off(&self, id: &str) -> SubscriptionResult<()> {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(SubscriptionError::Validation(reason)) => {
                tracing::debug!(
                    subscription_id = %id,
                    reason = %reason,
                    "Deactivating malformed subscription"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match record.status {
            SubscriptionStatus::Active | SubscriptionStatus::Error => {
                self.store
                    .transition(id, SubscriptionStatus::Off, record.error.as_deref())
                    .await?;
            }
            SubscriptionStatus::Requested | SubscriptionStatus::Off => {}
        }
        Ok(())
    }

    /// Re-evaluate pending subscriptions every `interval` until `shutdown`.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "Subscription lifecycle task started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reevaluate_pending().await;
                    self.dispatcher.prune_cancelled();
                }
            }
        }

        tracing::info!("Subscription lifecycle task stopped");
    }
}
