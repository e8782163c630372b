//! Delivery Dispatcher.
//!
//! ```text
//! Matcher --enqueue--> [bounded queue] --router--> lane(sub A) --worker--> channel.send
//!                                              \-> lane(sub B) --worker--> channel.send
//! ```
//!
//! The shared queue decouples matching from network I/O; a full queue makes
//! `enqueue` wait (backpressure). Each subscription gets its own bounded lane
//! drained by one worker, so sends for one subscription never overlap and
//! keep match order, while different subscriptions proceed concurrently. A
//! full lane drops the job with a warning rather than stall the router.
//!
//! Cancelling a subscription leaves a tombstone that discards its late jobs.
//! Tombstones expire after `tombstone_ttl`; a permanent failure closes the
//! subscription's lane.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ChannelRegistry;
use crate::config::DeliverySettings;
use crate::subscription_store::SubscriptionStore;
use crate::types::{DeliveryJob, DeliveryOutcome, SubscriptionStatus};

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Lane {
    sender: mpsc::Sender<DeliveryJob>,
    cancel: CancellationToken,
}

struct DispatcherInner {
    channels: ChannelRegistry,
    store: Arc<SubscriptionStore>,
    settings: DeliverySettings,
    lanes: DashMap<String, Lane>,
    /// Subscriptions whose jobs must not be sent, with the time of cancel.
    cancelled: DashMap<String, Instant>,
    stats: DeliveryStats,
    shutdown: CancellationToken,
}

/// Fans delivery jobs out to channel senders.
pub struct DeliveryDispatcher {
    queue: mpsc::Sender<DeliveryJob>,
    inner: Arc<DispatcherInner>,
}

impl DeliveryDispatcher {
    /// Create the dispatcher and spawn its router task.
    ///
    /// The router stops when `shutdown` is cancelled or every dispatcher
    /// handle is dropped; lane workers stop with it.
    pub fn start(
        channels: ChannelRegistry,
        store: Arc<SubscriptionStore>,
        settings: DeliverySettings,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (queue, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let inner = Arc::new(DispatcherInner {
            channels,
            store,
            settings,
            lanes: DashMap::new(),
            cancelled: DashMap::new(),
            stats: DeliveryStats::default(),
            shutdown,
        });

        let router = tokio::spawn(route(inner.clone(), receiver));
        (Arc::new(Self { queue, inner }), router)
    }

    /// Queue a job, waiting while the queue is full.
    pub async fn enqueue(&self, job: DeliveryJob) {
        if self.inner.cancelled.contains_key(&job.subscription_id) {
            DeliveryStats::bump(&self.inner.stats.cancelled);
            return;
        }
        if self.queue.send(job).await.is_err() {
            tracing::warn!("Delivery queue closed, job discarded");
        }
    }

    /// Cancel queued and in-flight jobs for a subscription. Idempotent.
    ///
    /// A send already handed to the transport may still complete; its
    /// outcome is discarded.
    pub fn cancel(&self, subscription_id: &str) {
        self.prune_cancelled();
        let previous = self
            .inner
            .cancelled
            .insert(subscription_id.to_string(), Instant::now());
        close_lane(&self.inner, subscription_id);
        if previous.is_none() {
            tracing::debug!(subscription_id = %subscription_id, "Delivery cancelled");
        }
    }

    /// Allow delivery again for an id that was cancelled before. Called once
    /// a subscription with a reused id has been activated. Returns whether a
    /// tombstone was removed.
    pub fn reinstate(&self, subscription_id: &str) -> bool {
        self.inner.cancelled.remove(subscription_id).is_some()
    }

    pub fn is_cancelled(&self, subscription_id: &str) -> bool {
        self.inner.cancelled.contains_key(subscription_id)
    }

    /// Forget tombstones older than `tombstone_ttl`. Returns how many expired.
    pub fn prune_cancelled(&self) -> usize {
        let ttl = self.inner.settings.tombstone_ttl();
        let before = self.inner.cancelled.len();
        self.inner.cancelled.retain(|_, at| at.elapsed() < ttl);
        let expired = before.saturating_sub(self.inner.cancelled.len());
        if expired > 0 {
            tracing::debug!(expired, "Expired delivery tombstones");
        }
        expired
    }

    pub fn cancelled_count(&self) -> usize {
        self.inner.cancelled.len()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn lane_count(&self) -> usize {
        self.inner.lanes.len()
    }
}

async fn route(inner: Arc<DispatcherInner>, mut receiver: mpsc::Receiver<DeliveryJob>) {
    tracing::info!("Delivery dispatcher started");

    loop {
        let job = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if inner.cancelled.contains_key(&job.subscription_id) {
            DeliveryStats::bump(&inner.stats.cancelled);
            continue;
        }

        let mut job = Some(job);
        // A lane whose worker exited is replaced once.
        for _ in 0..2 {
            let Some(pending) = job.take() else { break };
            let sender = lane_sender(&inner, &pending.subscription_id);
            match sender.try_send(pending) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    DeliveryStats::bump(&inner.stats.dropped);
                    tracing::warn!(
                        subscription_id = %dropped.subscription_id,
                        resource_id = %dropped.resource_id,
                        "Delivery lane full, job dropped"
                    );
                }
                Err(TrySendError::Closed(returned)) => {
                    inner.lanes.remove(&returned.subscription_id);
                    job = Some(returned);
                }
            }
        }
    }

    for lane in inner.lanes.iter() {
        lane.cancel.cancel();
    }
    inner.lanes.clear();
    tracing::info!("Delivery dispatcher stopped");
}

fn close_lane(inner: &DispatcherInner, subscription_id: &str) {
    if let Some((_, lane)) = inner.lanes.remove(subscription_id) {
        lane.cancel.cancel();
    }
}

fn lane_sender(inner: &Arc<DispatcherInner>, subscription_id: &str) -> mpsc::Sender<DeliveryJob> {
    inner
        .lanes
        .entry(subscription_id.to_string())
        .or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(inner.settings.lane_capacity.max(1));
            let cancel = inner.shutdown.child_token();
            tokio::spawn(run_lane(
                inner.clone(),
                subscription_id.to_string(),
                receiver,
                cancel.clone(),
            ));
            tracing::trace!(subscription_id = %subscription_id, "Delivery lane opened");
            Lane { sender, cancel }
        })
        .sender
        .clone()
}

async fn run_lane(
    inner: Arc<DispatcherInner>,
    subscription_id: String,
    mut receiver: mpsc::Receiver<DeliveryJob>,
    cancel: CancellationToken,
) {
    loop {
        // A lane opened while a cancel was racing the router closes itself.
        if inner.cancelled.contains_key(&subscription_id) {
            break;
        }

        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        deliver(&inner, job, &cancel).await;
    }

    // Anything still buffered belongs to a cancelled subscription.
    receiver.close();
    while receiver.try_recv().is_ok() {
        DeliveryStats::bump(&inner.stats.cancelled);
    }
}

/// Attempt one job with bounded retries.
async fn deliver(inner: &DispatcherInner, mut job: DeliveryJob, cancel: &CancellationToken) {
    let Some(channel) = inner.channels.get(&job.channel_type).cloned() else {
        DeliveryStats::bump(&inner.stats.failed);
        tracing::warn!(
            subscription_id = %job.subscription_id,
            channel_type = %job.channel_type,
            "No delivery channel registered, job discarded"
        );
        return;
    };

    let settings = &inner.settings;

    loop {
        if cancel.is_cancelled() || inner.cancelled.contains_key(&job.subscription_id) {
            DeliveryStats::bump(&inner.stats.cancelled);
            return;
        }

        job.attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                DeliveryStats::bump(&inner.stats.cancelled);
                return;
            }
            result = tokio::time::timeout(settings.send_timeout(), channel.send(&job)) => {
                result.unwrap_or_else(|_| DeliveryOutcome::TransientFailure("send timed out".to_string()))
            }
        };

        if inner.cancelled.contains_key(&job.subscription_id) {
            DeliveryStats::bump(&inner.stats.cancelled);
            return;
        }

        match outcome {
            DeliveryOutcome::Delivered => {
                DeliveryStats::bump(&inner.stats.delivered);
                tracing::debug!(
                    subscription_id = %job.subscription_id,
                    resource_type = %job.resource_type,
                    resource_id = %job.resource_id,
                    attempt = job.attempt,
                    "Notification delivered"
                );
                return;
            }
            DeliveryOutcome::Dropped(reason) => {
                DeliveryStats::bump(&inner.stats.dropped);
                tracing::debug!(
                    subscription_id = %job.subscription_id,
                    reason = %reason,
                    "Notification dropped"
                );
                return;
            }
            DeliveryOutcome::TransientFailure(reason) if job.attempt < settings.max_attempts => {
                DeliveryStats::bump(&inner.stats.retried);
                let backoff = settings.backoff(job.attempt);
                tracing::debug!(
                    subscription_id = %job.subscription_id,
                    attempt = job.attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %reason,
                    "Transient delivery failure, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        DeliveryStats::bump(&inner.stats.cancelled);
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            DeliveryOutcome::TransientFailure(reason) => {
                DeliveryStats::bump(&inner.stats.failed);
                tracing::warn!(
                    subscription_id = %job.subscription_id,
                    attempts = job.attempt,
                    reason = %reason,
                    "Delivery retries exhausted, job discarded"
                );
                return;
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                DeliveryStats::bump(&inner.stats.failed);
                tracing::warn!(
                    subscription_id = %job.subscription_id,
                    reason = %reason,
                    "Permanent delivery failure"
                );
                fail_subscription(inner, &job.subscription_id, &reason).await;
                return;
            }
        }
    }
}

/// Move an active subscription to `error` after a permanent failure and
/// close its lane. Jobs still buffered in the lane are discarded.
async fn fail_subscription(inner: &DispatcherInner, subscription_id: &str, reason: &str) {
    close_lane(inner, subscription_id);
    match inner
        .store
        .transition(subscription_id, SubscriptionStatus::Error, Some(reason))
        .await
    {
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Could not record delivery failure on subscription"
            );
        }
    }
}
