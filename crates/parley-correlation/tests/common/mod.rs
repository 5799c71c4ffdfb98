//! Shared helpers for engine scenarios over the loopback broker.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parley_correlation::{
    CorrelationConfig, CorrelationEngine, CorrelationMode, LoopbackBehavior, LoopbackBroker,
    StatsSnapshot,
};

/// Destination that echoes the request payload.
pub const ECHO: &str = "echo";

/// Destination that never replies.
pub const VOID: &str = "void";

/// Config with short timings suited to paused-time tests.
pub fn test_config(mode: CorrelationMode) -> CorrelationConfig {
    CorrelationConfig {
        mode,
        request_timeout_ms: 500,
        sweep_interval_ms: 10,
        early_reply_ttl_ms: 1_000,
        tombstone_retention_ms: 2_000,
        ..Default::default()
    }
}

/// Start an engine over a broker with [`ECHO`] and [`VOID`] bound.
pub fn start_engine(
    config: CorrelationConfig,
    behavior: LoopbackBehavior,
) -> (CorrelationEngine<LoopbackBroker>, Arc<LoopbackBroker>) {
    let (engine, broker) = CorrelationEngine::with_loopback(config, behavior);
    broker.bind_echo(ECHO);
    broker.bind(VOID, |_| None);
    (engine, broker)
}

/// Behavior for a broker that replies with the caller's own key.
pub fn echoing_provisional() -> LoopbackBehavior {
    LoopbackBehavior {
        assign_ids: false,
        echo_provisional: true,
        ..Default::default()
    }
}

pub fn payload(n: usize) -> Bytes {
    Bytes::from(format!("request-{n}"))
}

/// Every registered request reached exactly one terminal outcome.
pub fn assert_settled(stats: &StatsSnapshot) {
    assert_eq!(stats.pending, 0, "requests still pending: {stats:?}");
    assert_eq!(
        stats.settled(),
        stats.registered,
        "terminal outcomes do not match registrations: {stats:?}"
    );
}

pub const LONG: Duration = Duration::from_secs(60);
