//! Subscription error types.

use octofhir_storage::StorageError;

use crate::types::SubscriptionStatus;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors that can occur in the subscription engine.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// Malformed topic or subscription.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Subscription topic not found: {0}")]
    TopicNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// A websocket session asked for a subscription it cannot bind to.
    #[error("{0}")]
    NotBindable(String),

    /// Retryable send failure.
    #[error("Transient delivery error: {0}")]
    TransientDelivery(String),

    /// Non-retryable send failure.
    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    /// Lost a compare-and-set race on a status transition. Re-read and retry.
    #[error("Concurrent status change on subscription {id}")]
    ConcurrencyConflict { id: String },

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SubscriptionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the caller should re-read and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
