//! WebSocket delivery channel.
//!
//! Sessions are registered by the transport layer after a client binds to a
//! subscription. Each subscription has zero or one live session; delivering a
//! job pushes a content-free `ping` into that session's bounded buffer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use url::Url;

use super::DeliveryChannel;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{ChannelType, DeliveryJob, DeliveryOutcome, SubscriptionChannel};

/// Default per-session outbound buffer.
pub const DEFAULT_SESSION_BUFFER: usize = 32;

/// Encoding the client asked for when binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionEncoding {
    #[default]
    Json,
    Xml,
}

impl SessionEncoding {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "json" | "application/fhir+json" => Some(Self::Json),
            "xml" | "application/fhir+xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

/// Message for the transport task that owns a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// New matching data exists for the subscription.
    Ping { subscription_id: String },
    /// The session was replaced or the subscription turned off.
    Close { reason: String },
}

impl SessionMessage {
    /// Wire text for a ping.
    pub fn ping_text(subscription_id: &str) -> String {
        format!("ping {subscription_id}")
    }
}

/// Identifies one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub subscription_id: String,
    pub session_id: u64,
    pub encoding: SessionEncoding,
}

struct SessionEntry {
    session_id: u64,
    sender: mpsc::Sender<SessionMessage>,
}

/// Map of subscription id to its live session.
pub struct WebSocketRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_session_id: AtomicU64,
    buffer: usize,
}

impl Default for WebSocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SESSION_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a session for a subscription.
    ///
    /// Replaces any earlier session for the same subscription; the earlier
    /// session receives [`SessionMessage::Close`]. The returned receiver is
    /// drained by the transport task.
    pub fn register_session(
        &self,
        subscription_id: &str,
        encoding: SessionEncoding,
    ) -> (SessionHandle, mpsc::Receiver<SessionMessage>) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);

        let previous = self.sessions.write().insert(
            subscription_id.to_string(),
            SessionEntry { session_id, sender },
        );

        if let Some(previous) = previous {
            let _ = previous.sender.try_send(SessionMessage::Close {
                reason: "replaced by a newer session".to_string(),
            });
            tracing::debug!(
                subscription_id = %subscription_id,
                replaced_session = previous.session_id,
                "WebSocket session replaced"
            );
        }

        tracing::debug!(
            subscription_id = %subscription_id,
            session_id,
            "WebSocket session registered"
        );

        (
            SessionHandle {
                subscription_id: subscription_id.to_string(),
                session_id,
                encoding,
            },
            receiver,
        )
    }

    /// Unregister a session. A no-op if it was already replaced.
    pub fn on_session_closed(&self, handle: &SessionHandle) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(&handle.subscription_id)
            .is_some_and(|e| e.session_id == handle.session_id)
        {
            sessions.remove(&handle.subscription_id);
            tracing::debug!(
                subscription_id = %handle.subscription_id,
                session_id = handle.session_id,
                "WebSocket session unregistered"
            );
        }
    }

    /// Drop the session of a subscription, telling it to close.
    pub fn close_subscription(&self, subscription_id: &str, reason: &str) {
        if let Some(entry) = self.sessions.write().remove(subscription_id) {
            let _ = entry.sender.try_send(SessionMessage::Close {
                reason: reason.to_string(),
            });
        }
    }

    pub fn has_session(&self, subscription_id: &str) -> bool {
        self.sessions.read().contains_key(subscription_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Push a ping to the subscription's live session.
    pub fn send_ping(&self, subscription_id: &str) -> DeliveryOutcome {
        let result = {
            let sessions = self.sessions.read();
            let Some(entry) = sessions.get(subscription_id) else {
                return DeliveryOutcome::Dropped("no live session".to_string());
            };
            entry
                .sender
                .try_send(SessionMessage::Ping {
                    subscription_id: subscription_id.to_string(),
                })
                .map_err(|e| (entry.session_id, e))
        };

        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err((_, TrySendError::Full(_))) => {
                DeliveryOutcome::TransientFailure("session buffer full".to_string())
            }
            Err((session_id, TrySendError::Closed(_))) => {
                let mut sessions = self.sessions.write();
                if sessions
                    .get(subscription_id)
                    .is_some_and(|e| e.session_id == session_id)
                {
                    sessions.remove(subscription_id);
                }
                DeliveryOutcome::Dropped("session closed".to_string())
            }
        }
    }
}

/// [`DeliveryChannel`] for `websocket` subscriptions.
pub struct WebSocketChannel {
    registry: Arc<WebSocketRegistry>,
}

impl WebSocketChannel {
    pub fn new(registry: Arc<WebSocketRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WebSocketRegistry> {
        &self.registry
    }
}

#[async_trait]
impl DeliveryChannel for WebSocketChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebSocket
    }

    /// No connection is needed up front. An endpoint, if given, must be a
    /// `ws`/`wss` url.
    fn provision(&self, channel: &SubscriptionChannel) -> SubscriptionResult<()> {
        let Some(endpoint) = channel.endpoint.as_deref() else {
            return Ok(());
        };
        let url = Url::parse(endpoint).map_err(|e| {
            SubscriptionError::validation(format!("Invalid websocket endpoint {endpoint}: {e}"))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(SubscriptionError::validation(format!(
                "Websocket endpoint must use ws or wss, not {other}"
            ))),
        }
    }

    async fn send(&self, job: &DeliveryJob) -> DeliveryOutcome {
        self.registry.send_ping(&job.subscription_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(endpoint: Option<&str>) -> SubscriptionChannel {
        SubscriptionChannel {
            channel_type: ChannelType::WebSocket,
            endpoint: endpoint.map(str::to_string),
            content_type: "application/fhir+json".to_string(),
        }
    }

    #[test]
    fn ping_without_session_is_dropped() {
        let registry = WebSocketRegistry::new();
        assert!(matches!(
            registry.send_ping("s1"),
            DeliveryOutcome::Dropped(_)
        ));
    }

    #[tokio::test]
    async fn ping_reaches_registered_session() {
        let registry = WebSocketRegistry::new();
        let (_handle, mut rx) = registry.register_session("s1", SessionEncoding::Json);

        assert_eq!(registry.send_ping("s1"), DeliveryOutcome::Delivered);
        assert_eq!(
            rx.recv().await,
            Some(SessionMessage::Ping {
                subscription_id: "s1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn second_bind_replaces_first() {
        let registry = WebSocketRegistry::new();
        let (first, mut first_rx) = registry.register_session("s1", SessionEncoding::Json);
        let (second, mut second_rx) = registry.register_session("s1", SessionEncoding::Json);

        assert_eq!(registry.session_count(), 1);
        assert!(matches!(
            first_rx.recv().await,
            Some(SessionMessage::Close { .. })
        ));

        // Closing the stale handle must not remove the new session.
        registry.on_session_closed(&first);
        assert!(registry.has_session("s1"));

        registry.send_ping("s1");
        assert!(matches!(
            second_rx.recv().await,
            Some(SessionMessage::Ping { .. })
        ));

        registry.on_session_closed(&second);
        assert!(!registry.has_session("s1"));
    }

    #[test]
    fn full_buffer_is_transient_and_closed_is_dropped() {
        let registry = WebSocketRegistry::with_buffer(1);
        let (_handle, rx) = registry.register_session("s1", SessionEncoding::Json);

        assert_eq!(registry.send_ping("s1"), DeliveryOutcome::Delivered);
        assert!(matches!(
            registry.send_ping("s1"),
            DeliveryOutcome::TransientFailure(_)
        ));

        drop(rx);
        assert!(matches!(
            registry.send_ping("s1"),
            DeliveryOutcome::Dropped(_)
        ));
        assert!(!registry.has_session("s1"));
    }

    #[test]
    fn provision_checks_endpoint_scheme() {
        let ws = WebSocketChannel::new(Arc::new(WebSocketRegistry::new()));
        assert!(ws.provision(&channel(None)).is_ok());
        assert!(ws.provision(&channel(Some("wss://example.org/ws"))).is_ok());
        assert!(ws.provision(&channel(Some("https://example.org/ws"))).is_err());
        assert!(ws.provision(&channel(Some("not a url"))).is_err());
    }

    #[test]
    fn ping_text() {
        assert_eq!(SessionMessage::ping_text("abc"), "ping abc");
    }
}
