//! Expiry Sweeper.
//!
//! Periodically removes requests whose deadline has passed and fails them
//! with [`CorrelationError::Timeout`](crate::CorrelationError::Timeout).

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::PendingReplyRegistry;

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Requests failed with a timeout
    pub expired: usize,
    /// Tombstones forgotten
    pub tombstones_purged: usize,
    /// Buffered replies dropped because no rename claimed them
    pub unclaimed_replies: usize,
}

#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    registry: PendingReplyRegistry,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: PendingReplyRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Expire and purge everything due at `now`.
    pub fn sweep_once(&self, now: Instant) -> SweepReport {
        let expired = self.registry.expire_older_than(now);
        let count = expired.len();
        for request in expired {
            let key = request.key.clone();
            if !request.fail_with_timeout() {
                debug!(key = %key, "Timed out request had no waiting caller");
            }
        }

        let purged = self.registry.purge_retained(now);
        SweepReport {
            expired: count,
            tombstones_purged: purged.tombstones,
            unclaimed_replies: purged.unclaimed_replies,
        }
    }

    /// Sweep every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Expiry sweeper started");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep_once(Instant::now());
                    if report.expired > 0 {
                        debug!(expired = report.expired, "Sweep expired pending requests");
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelationConfig;
    use crate::error::CorrelationError;
    use crate::key::CorrelationKey;
    use crate::transport::ReplyMessage;

    fn registry() -> PendingReplyRegistry {
        PendingReplyRegistry::new(&CorrelationConfig::default())
    }

    #[tokio::test]
    async fn test_sweep_fails_expired_with_timeout() {
        let registry = registry();
        let start = Instant::now();
        let waiter = registry
            .register(CorrelationKey::from("P2"), start + Duration::from_millis(50))
            .unwrap();
        let sweeper = ExpirySweeper::new(registry.clone(), Duration::from_millis(10));

        let report = sweeper.sweep_once(start + Duration::from_millis(60));
        assert_eq!(report.expired, 1);

        match waiter.await {
            Err(CorrelationError::Timeout { key, waited }) => {
                assert_eq!(key, CorrelationKey::from("P2"));
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_ignores_completed() {
        let registry = registry();
        let start = Instant::now();
        let waiter = registry
            .register(CorrelationKey::from("P1"), start + Duration::from_millis(500))
            .unwrap();
        registry.complete_by_key(ReplyMessage::new("P1", "pong"));

        let sweeper = ExpirySweeper::new(registry.clone(), Duration::from_millis(10));
        assert_eq!(sweeper.sweep_once(start + Duration::from_secs(1)).expired, 0);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_expires_on_schedule() {
        let registry = registry();
        let waiter = registry
            .register(
                CorrelationKey::from("P1"),
                Instant::now() + Duration::from_millis(250),
            )
            .unwrap();
        let shutdown = CancellationToken::new();
        let sweeper = ExpirySweeper::new(registry.clone(), Duration::from_millis(100));
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { sweeper.run(shutdown).await }
        });

        // Paused time auto-advances while every task is idle.
        let err = waiter.await.unwrap_err();
        assert!(err.is_timeout());

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(registry.stats().timeouts, 1);
    }
}
