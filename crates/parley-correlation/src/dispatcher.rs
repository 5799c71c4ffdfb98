//! Reply Dispatcher.
//!
//! Consumes inbound replies and hands each to the registry. Replies that find
//! no waiter are normal under timeout races and are only counted and logged.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{PendingReplyRegistry, ReplyOutcome};
use crate::transport::{ReplyMessage, ReplyReceiver};

#[derive(Debug, Clone)]
pub struct ReplyDispatcher {
    registry: PendingReplyRegistry,
}

impl ReplyDispatcher {
    pub fn new(registry: PendingReplyRegistry) -> Self {
        Self { registry }
    }

    /// Match a single reply. Safe to call from any task or thread.
    pub fn dispatch(&self, reply: ReplyMessage) -> ReplyOutcome {
        self.registry.complete_by_key(reply)
    }

    /// Drain `replies` until the channel closes or `shutdown` fires.
    ///
    /// Returns the number of replies consumed.
    pub async fn run(&self, mut replies: ReplyReceiver, shutdown: CancellationToken) -> u64 {
        info!("Reply dispatcher started");
        let mut consumed = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, reply dispatcher stopping");
                    break;
                }
                reply = replies.recv() => match reply {
                    Some(reply) => {
                        consumed += 1;
                        self.dispatch(reply);
                    }
                    None => {
                        debug!("Reply channel closed, reply dispatcher stopping");
                        break;
                    }
                },
            }
        }

        info!(consumed, "Reply dispatcher stopped");
        consumed
    }
}
