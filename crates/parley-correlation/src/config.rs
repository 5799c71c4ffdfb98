//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default request timeout (20 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;

/// Default interval between expiry sweeps (1 second)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Maximum number of requests waiting for a reply
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// How long an early reply is held for a rename that has not happened yet
pub const DEFAULT_EARLY_REPLY_TTL_MS: u64 = 5_000;

/// How long a completed or expired key is remembered
pub const DEFAULT_TOMBSTONE_RETENTION_MS: u64 = 60_000;

/// Capacity of the inbound reply channel
pub const DEFAULT_REPLY_CHANNEL_CAPACITY: usize = 1024;

/// Which identifier replies are correlated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Replies carry the key the caller generated before sending.
    Provisional,
    /// Replies carry the id the transport assigned to the sent message.
    #[default]
    TransportAssigned,
}

/// Correlation engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Which identifier replies are correlated on
    pub mode: CorrelationMode,
    /// Deadline applied to requests sent without an explicit timeout
    pub request_timeout_ms: u64,
    /// Interval between expiry sweeps
    pub sweep_interval_ms: u64,
    /// Maximum number of pending requests, and of buffered early replies (0 means unbounded)
    pub max_pending: usize,
    /// How long a reply with no matching key is buffered (0 disables buffering)
    pub early_reply_ttl_ms: u64,
    /// How long completed or expired keys are remembered for duplicate detection
    pub tombstone_retention_ms: u64,
    /// Capacity of the inbound reply channel
    pub reply_channel_capacity: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            mode: CorrelationMode::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_pending: DEFAULT_MAX_PENDING,
            early_reply_ttl_ms: DEFAULT_EARLY_REPLY_TTL_MS,
            tombstone_retention_ms: DEFAULT_TOMBSTONE_RETENTION_MS,
            reply_channel_capacity: DEFAULT_REPLY_CHANNEL_CAPACITY,
        }
    }
}

impl CorrelationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Sweep interval, never shorter than one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn early_reply_ttl(&self) -> Duration {
        Duration::from_millis(self.early_reply_ttl_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }

    /// Reply channel capacity, never zero.
    pub fn reply_channel_capacity(&self) -> usize {
        self.reply_channel_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CorrelationConfig::default();
        assert_eq!(config.mode, CorrelationMode::TransportAssigned);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CorrelationConfig =
            serde_json::from_str(r#"{"mode":"provisional","max_pending":5}"#).unwrap();
        assert_eq!(config.mode, CorrelationMode::Provisional);
        assert_eq!(config.max_pending, 5);
        assert_eq!(config.early_reply_ttl_ms, DEFAULT_EARLY_REPLY_TTL_MS);
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = CorrelationConfig {
            sweep_interval_ms: 0,
            reply_channel_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
        assert_eq!(config.reply_channel_capacity(), 1);
    }
}
