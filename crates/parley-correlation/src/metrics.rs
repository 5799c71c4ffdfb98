//! Correlation metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("parley-correlation"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for inbound replies by outcome.
pub fn replies() -> Counter<u64> {
    meter()
        .u64_counter("correlation.replies")
        .with_description("Total inbound replies by match outcome")
        .with_unit("reply")
        .build()
}

/// Counter for send notifications by rename outcome.
pub fn renames() -> Counter<u64> {
    meter()
        .u64_counter("correlation.renames")
        .with_description("Total send notifications by rename outcome")
        .with_unit("rename")
        .build()
}

/// Counter for requests failed by the expiry sweeper.
pub fn timeouts() -> Counter<u64> {
    meter()
        .u64_counter("correlation.timeouts")
        .with_description("Total requests that timed out waiting for a reply")
        .with_unit("request")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for requests waiting for a reply.
pub fn pending() -> Gauge<i64> {
    meter()
        .i64_gauge("correlation.pending")
        .with_description("Current number of requests waiting for a reply")
        .with_unit("request")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for time between registration and reply delivery.
pub fn round_trip() -> Histogram<f64> {
    meter()
        .f64_histogram("correlation.round_trip")
        .with_description("Time from request registration to reply delivery")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record the outcome of matching one inbound reply.
pub fn record_reply(outcome: &str) {
    replies().add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

/// Record the outcome of one send notification.
pub fn record_rename(outcome: &str) {
    renames().add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

/// Record requests expired in one sweep.
pub fn record_timeouts(count: u64) {
    if count > 0 {
        timeouts().add(count, &[]);
    }
}

/// Record the pending request count.
pub fn record_pending(count: usize) {
    pending().record(count as i64, &[]);
}

/// Record reply latency in milliseconds.
pub fn record_round_trip(latency_ms: f64) {
    round_trip().record(latency_ms, &[]);
}
