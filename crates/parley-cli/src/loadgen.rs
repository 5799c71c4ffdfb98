//! Loopback load generator.
//!
//! Drives a correlation engine over the in-memory broker and reports how
//! every request ended.

use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parley_correlation::{
    CorrelationConfig, CorrelationEngine, CorrelationError, CorrelationMode, LoopbackBehavior,
    StatsSnapshot,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

const DESTINATION: &str = "loadgen.echo";

/// One load generator run
#[derive(Debug, Clone)]
pub struct LoadgenOptions {
    pub requests: usize,
    pub concurrency: usize,
    pub payload_size: usize,
    pub timeout: Option<Duration>,
    pub behavior: LoopbackBehavior,
}

/// Caller-side tally of a run, plus the engine's own counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadgenReport {
    pub requests: usize,
    pub replied: usize,
    pub mismatched: usize,
    pub timed_out: usize,
    pub send_failed: usize,
    pub other_errors: usize,
    pub elapsed_ms: u64,
    pub engine: StatsSnapshot,
}

impl LoadgenReport {
    fn record(&mut self, expected: &Bytes, result: Result<Bytes, CorrelationError>) {
        match result {
            Ok(payload) if payload == *expected => self.replied += 1,
            Ok(_) => self.mismatched += 1,
            Err(CorrelationError::Timeout { .. }) => self.timed_out += 1,
            Err(CorrelationError::SendFailed(_)) => self.send_failed += 1,
            Err(_) => self.other_errors += 1,
        }
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let secs = (self.elapsed_ms as f64 / 1000.0).max(0.001);
        format!(
            "requests:     {}\n\
             replied:      {}\n\
             mismatched:   {}\n\
             timed out:    {}\n\
             send failed:  {}\n\
             other errors: {}\n\
             elapsed:      {} ms ({:.0} req/s)\n\
             renames:      {} relocated, {} already satisfied, {} stale, {} kept provisional\n\
             replies:      {} buffered, {} duplicate, {} unmatched",
            self.requests,
            self.replied,
            self.mismatched,
            self.timed_out,
            self.send_failed,
            self.other_errors,
            self.elapsed_ms,
            self.requests as f64 / secs,
            self.engine.relocated,
            self.engine.already_satisfied,
            self.engine.stale_renames,
            self.engine.kept_provisional,
            self.engine.buffered,
            self.engine.duplicates,
            self.engine.unmatched,
        )
    }
}

/// Broker behavior consistent with the correlation mode.
///
/// Without a readable assigned id the responder can only echo the provisional key.
pub fn behavior_for(mode: CorrelationMode, mut behavior: LoopbackBehavior) -> LoopbackBehavior {
    if mode == CorrelationMode::Provisional || !behavior.assign_ids || behavior.fail_assignment {
        behavior.echo_provisional = true;
    }
    behavior
}

fn request_payload(n: usize, size: usize) -> Bytes {
    let mut body = format!("{n}:").into_bytes();
    body.resize(size.max(body.len()), b'.');
    Bytes::from(body)
}

/// Run the load generator to completion.
pub async fn run(config: CorrelationConfig, options: LoadgenOptions) -> Result<LoadgenReport> {
    if options.concurrency == 0 {
        bail!("concurrency must be at least 1");
    }

    let behavior = behavior_for(config.mode, options.behavior.clone());
    info!(
        requests = options.requests,
        concurrency = options.concurrency,
        mode = ?config.mode,
        ?behavior,
        "Starting loopback load"
    );

    let (engine, broker) = CorrelationEngine::with_loopback(config, behavior);
    broker.bind_echo(DESTINATION);
    let requester = engine.requester().clone();

    let timeout = options.timeout;
    let payload_size = options.payload_size;
    let started = Instant::now();
    let mut report = stream::iter(0..options.requests)
        .map(|n| {
            let requester = requester.clone();
            let payload = request_payload(n, payload_size);
            async move {
                let result = requester
                    .request(DESTINATION, payload.clone(), timeout)
                    .await
                    .map(|reply| reply.payload);
                (payload, result)
            }
        })
        .buffer_unordered(options.concurrency)
        .fold(LoadgenReport::default(), |mut report, (payload, result)| async move {
            report.record(&payload, result);
            report
        })
        .await;

    report.requests = options.requests;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    debug!(sent = broker.sent_count(), "All requests settled");
    report.engine = engine.shutdown().await;
    Ok(report)
}
