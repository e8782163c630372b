//! Engine settings, deserialized from the `[subscriptions]` config section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Master switch for matching and delivery.
    pub enabled: bool,
    /// Expose the `/websocket` binding endpoint.
    pub websocket_enabled: bool,
    /// Bounded interval between re-evaluations of `requested` subscriptions.
    pub reevaluate_interval_ms: u64,
    /// How long a `requested` subscription may wait for its topic before it
    /// is moved to `error`.
    pub activation_timeout_ms: u64,
    pub delivery: DeliverySettings,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            websocket_enabled: true,
            reevaluate_interval_ms: 1000,
            activation_timeout_ms: 30_000,
            delivery: DeliverySettings::default(),
        }
    }
}

impl SubscriptionSettings {
    pub fn reevaluate_interval(&self) -> Duration {
        Duration::from_millis(self.reevaluate_interval_ms)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.reevaluate_interval_ms == 0 {
            return Err("subscriptions.reevaluate_interval_ms must be > 0".into());
        }
        self.delivery.validate()
    }
}

/// Dispatcher queue sizes and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliverySettings {
    /// Capacity of the matcher -> dispatcher queue. A full queue applies
    /// backpressure to the matcher.
    pub queue_capacity: usize,
    /// Capacity of each per-subscription lane.
    pub lane_capacity: usize,
    /// Total attempts for a job, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on a single channel send.
    pub send_timeout_ms: u64,
    /// How long a cancelled subscription id keeps discarding late jobs.
    pub tombstone_ttl_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            lane_capacity: 64,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            send_timeout_ms: 10_000,
            tombstone_ttl_ms: 300_000,
        }
    }
}

impl DeliverySettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    /// Backoff before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 || self.lane_capacity == 0 {
            return Err("subscriptions.delivery capacities must be > 0".into());
        }
        if self.max_attempts == 0 {
            return Err("subscriptions.delivery.max_attempts must be >= 1".into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(
                "subscriptions.delivery.initial_backoff_ms must not exceed max_backoff_ms".into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = DeliverySettings {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            ..Default::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(400));
        assert_eq!(settings.backoff(4), Duration::from_millis(500));
        assert_eq!(settings.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn defaults_validate() {
        assert!(SubscriptionSettings::default().validate().is_ok());

        let bad = DeliverySettings {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
