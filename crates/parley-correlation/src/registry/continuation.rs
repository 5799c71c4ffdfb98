//! Caller-side and registry-side halves of a pending request.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use super::pending_registry::{EntryId, PendingReplyRegistry};
use crate::error::CorrelationError;
use crate::key::CorrelationKey;
use crate::transport::ReplyMessage;

pub(crate) type ReplyResult = Result<ReplyMessage, CorrelationError>;

/// Registry-side handle that resolves a caller's [`ReplyWaiter`].
///
/// Consumed on use, so a request is resolved at most once.
pub struct Continuation {
    tx: oneshot::Sender<ReplyResult>,
}

impl Continuation {
    pub(crate) fn new(tx: oneshot::Sender<ReplyResult>) -> Self {
        Self { tx }
    }

    /// Deliver the reply. Returns false if the caller already went away.
    pub fn complete(self, reply: ReplyMessage) -> bool {
        self.tx.send(Ok(reply)).is_ok()
    }

    /// Resolve the request with a failure. Returns false if the caller already went away.
    pub fn fail(self, error: CorrelationError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Whether the caller dropped its waiter.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// A request removed from the registry because its deadline passed.
#[derive(Debug)]
pub struct ExpiredRequest {
    /// Key the request was live under when it expired
    pub key: CorrelationKey,
    /// Time between registration and expiry
    pub waited: Duration,
    /// Continuation still waiting for its terminal signal
    pub continuation: Continuation,
}

impl ExpiredRequest {
    /// Signal the timeout to the caller.
    pub fn fail_with_timeout(self) -> bool {
        let error = CorrelationError::Timeout {
            key: self.key,
            waited: self.waited,
        };
        self.continuation.fail(error)
    }
}

/// Awaitable handed to the caller of a request.
///
/// Resolves exactly once: with the reply, a timeout, or another failure.
/// Dropping it before it resolves cancels the request and removes its
/// registry entry.
pub struct ReplyWaiter {
    key: CorrelationKey,
    id: EntryId,
    rx: oneshot::Receiver<ReplyResult>,
    registry: PendingReplyRegistry,
    settled: bool,
}

impl ReplyWaiter {
    pub(crate) fn new(
        key: CorrelationKey,
        id: EntryId,
        rx: oneshot::Receiver<ReplyResult>,
        registry: PendingReplyRegistry,
    ) -> Self {
        Self {
            key,
            id,
            rx,
            registry,
            settled: false,
        }
    }

    /// The key the request was registered under before it was sent.
    pub fn provisional_key(&self) -> &CorrelationKey {
        &self.key
    }
}

impl Future for ReplyWaiter {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.rx).poll(cx));
        self.settled = true;
        // A sender dropped without a value means the entry was torn down unresolved.
        Poll::Ready(result.unwrap_or(Err(CorrelationError::Cancelled)))
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.cancel_entry(self.id);
        }
    }
}

impl fmt::Debug for ReplyWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyWaiter")
            .field("key", &self.key)
            .field("settled", &self.settled)
            .finish()
    }
}
