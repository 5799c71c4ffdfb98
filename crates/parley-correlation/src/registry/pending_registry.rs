//! Pending-Reply Registry implementation.
//!
//! Tracks requests waiting for a reply by their live correlation key.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::continuation::{Continuation, ExpiredRequest, ReplyWaiter};
use crate::config::CorrelationConfig;
use crate::error::{CorrelationError, RegistryError};
use crate::key::{CorrelationKey, KeyKind};
use crate::metrics;
use crate::stats::{CorrelationStats, StatsSnapshot};
use crate::transport::ReplyMessage;

pub(crate) type EntryId = u64;

/// Lifecycle of a pending request.
///
/// Moves forward only: `AwaitingSend -> AwaitingReply -> Completed | Expired`.
/// A reply may complete an `AwaitingSend` entry directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    AwaitingSend,
    AwaitingReply,
    Completed,
    Expired,
}

/// Result of matching an inbound reply against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// A waiter existed and received the reply
    Delivered,
    /// No waiter yet; held until a pending rename claims it
    Buffered,
    /// The key was already completed; reply discarded
    Duplicate,
    /// No waiter exists or will exist; reply discarded
    Unmatched,
}

impl ReplyOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Buffered => "buffered",
            Self::Duplicate => "duplicate",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Result of moving an entry from its provisional key to its assigned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// The entry now lives under the new key and is still waiting
    Relocated,
    /// A reply had already arrived under the new key; the caller was completed with it
    AlreadySatisfied,
    /// The entry was already gone (expired, completed or cancelled); nothing changed
    Stale,
}

impl RenameOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relocated => "relocated",
            Self::AlreadySatisfied => "already_satisfied",
            Self::Stale => "stale",
        }
    }
}

/// Retained state dropped by [`PendingReplyRegistry::purge_retained`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    /// Tombstones past their retention window
    pub tombstones: usize,
    /// Buffered replies no rename claimed in time
    pub unclaimed_replies: usize,
}

struct PendingEntry {
    key: CorrelationKey,
    kind: KeyKind,
    state: EntryState,
    deadline: Instant,
    registered_at: Instant,
    continuation: Continuation,
}

struct Tombstone {
    state: EntryState,
    recorded_at: Instant,
}

struct BufferedReply {
    reply: ReplyMessage,
    received_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    next_id: EntryId,
    entries: HashMap<EntryId, PendingEntry>,
    keys: HashMap<CorrelationKey, EntryId>,
    deadlines: BTreeSet<(Instant, EntryId)>,
    awaiting_send: usize,
    early_replies: HashMap<CorrelationKey, BufferedReply>,
    early_order: VecDeque<(Instant, CorrelationKey)>,
    tombstones: HashMap<CorrelationKey, Tombstone>,
    tombstone_order: VecDeque<(Instant, CorrelationKey)>,
}

impl RegistryState {
    /// Remove an entry and every index pointing at it.
    fn take_entry(&mut self, id: EntryId) -> Option<PendingEntry> {
        let entry = self.entries.remove(&id)?;
        if self.keys.get(&entry.key) == Some(&id) {
            self.keys.remove(&entry.key);
        }
        self.deadlines.remove(&(entry.deadline, id));
        if entry.state == EntryState::AwaitingSend {
            self.awaiting_send -= 1;
        }
        Some(entry)
    }

    fn take_entry_by_key(&mut self, key: &CorrelationKey) -> Option<PendingEntry> {
        let id = self.keys.get(key).copied()?;
        self.take_entry(id)
    }

    fn mark_reply_expected(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.state == EntryState::AwaitingSend {
                entry.state = EntryState::AwaitingReply;
                self.awaiting_send -= 1;
            }
        }
    }

    fn reschedule(&mut self, id: EntryId, deadline: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.deadlines.remove(&(entry.deadline, id));
            entry.deadline = deadline;
            self.deadlines.insert((deadline, id));
        }
    }

    fn relocate(&mut self, id: EntryId, new_key: CorrelationKey) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.keys.remove(&entry.key);
            self.keys.insert(new_key.clone(), id);
            entry.key = new_key;
            entry.kind = KeyKind::Assigned;
        }
    }

    fn tombstone(&mut self, key: CorrelationKey, state: EntryState, now: Instant) {
        self.tombstones.insert(
            key.clone(),
            Tombstone {
                state,
                recorded_at: now,
            },
        );
        self.tombstone_order.push_back((now, key));
    }

    fn buffer_reply(&mut self, reply: ReplyMessage, now: Instant) {
        let key = reply.correlation_key.clone();
        self.early_replies.insert(
            key.clone(),
            BufferedReply {
                reply,
                received_at: now,
            },
        );
        self.early_order.push_back((now, key));
    }

    /// Expire tombstones recorded at or before `cutoff`.
    fn purge_tombstones(&mut self, cutoff: Instant) -> usize {
        let mut removed = 0;
        while let Some((recorded_at, _)) = self.tombstone_order.front() {
            if *recorded_at > cutoff {
                break;
            }
            let Some((recorded_at, key)) = self.tombstone_order.pop_front() else {
                break;
            };
            // The key may have been tombstoned again since; only drop the matching record.
            let current = self
                .tombstones
                .get(&key)
                .is_some_and(|t| t.recorded_at == recorded_at);
            if current {
                self.tombstones.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Drop buffered replies received at or before `cutoff`.
    fn purge_early_replies(&mut self, cutoff: Instant) -> Vec<CorrelationKey> {
        let mut dropped = Vec::new();
        while let Some((received_at, _)) = self.early_order.front() {
            if *received_at > cutoff {
                break;
            }
            let Some((received_at, key)) = self.early_order.pop_front() else {
                break;
            };
            let current = self
                .early_replies
                .get(&key)
                .is_some_and(|b| b.received_at == received_at);
            if current {
                self.early_replies.remove(&key);
                dropped.push(key);
            }
        }
        dropped
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    stats: CorrelationStats,
    max_pending: usize,
    /// Cap on buffered early replies (0 means unbounded)
    max_buffered: usize,
    early_reply_ttl: Duration,
    tombstone_retention: Duration,
    /// Last value published to the pending gauge
    reported_pending: AtomicUsize,
}

/// Registry of requests waiting for a reply.
///
/// Cheap to clone; clones share the same state. Every operation runs in one
/// short critical section, so rename, reply matching, expiry and
/// cancellation are linearizable with respect to each other. Continuations
/// are resolved after the lock is released; whichever path removes an entry
/// owns its continuation, which makes the terminal signal exactly-once.
///
/// ## Usage
///
/// ```ignore
/// let registry = PendingReplyRegistry::new(&config);
///
/// // Before sending:
/// let waiter = registry.register(CorrelationKey::provisional(), deadline)?;
///
/// // When the transport reports the id it assigned:
/// registry.rename_key(waiter.provisional_key(), &assigned, deadline)?;
///
/// // When a reply arrives:
/// registry.complete_by_key(reply);
///
/// // Periodically:
/// for expired in registry.expire_older_than(Instant::now()) {
///     expired.fail_with_timeout();
/// }
///
/// let reply = waiter.await?;
/// ```
#[derive(Clone)]
pub struct PendingReplyRegistry {
    inner: Arc<RegistryInner>,
}

impl PendingReplyRegistry {
    /// Create a registry using the limits from `config`.
    pub fn new(config: &CorrelationConfig) -> Self {
        debug!(
            max_pending = config.max_pending,
            early_reply_ttl_ms = config.early_reply_ttl_ms,
            "Creating pending-reply registry"
        );
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                stats: CorrelationStats::default(),
                max_pending: config.max_pending,
                max_buffered: config.max_pending,
                early_reply_ttl: config.early_reply_ttl(),
                tombstone_retention: config.tombstone_retention(),
                reported_pending: AtomicUsize::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Critical sections never panic while the state is half-updated.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn report_pending(&self, pending: usize) {
        self.inner.reported_pending.store(pending, Ordering::Relaxed);
        metrics::record_pending(pending);
    }

    /// Register a request under its provisional key.
    ///
    /// The returned waiter resolves once a reply is matched, the deadline
    /// passes, or the request fails.
    #[instrument(skip(self, deadline), fields(key = %key))]
    pub fn register(
        &self,
        key: CorrelationKey,
        deadline: Instant,
    ) -> Result<ReplyWaiter, RegistryError> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let (id, pending) = {
            let mut state = self.lock();
            if state.keys.contains_key(&key) {
                debug!("Correlation key already registered");
                return Err(RegistryError::KeyInUse(key));
            }
            if self.inner.max_pending > 0 && state.entries.len() >= self.inner.max_pending {
                warn!(limit = self.inner.max_pending, "Pending-reply registry at capacity");
                return Err(RegistryError::AtCapacity(self.inner.max_pending));
            }

            // A reused key starts over; its old terminal record no longer applies.
            state.tombstones.remove(&key);

            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                PendingEntry {
                    key: key.clone(),
                    kind: KeyKind::Provisional,
                    state: EntryState::AwaitingSend,
                    deadline,
                    registered_at: now,
                    continuation: Continuation::new(tx),
                },
            );
            state.keys.insert(key.clone(), id);
            state.deadlines.insert((deadline, id));
            state.awaiting_send += 1;
            (id, state.entries.len())
        };

        self.inner.stats.add_registered(1);
        self.report_pending(pending);
        debug!(pending, "Registered pending request");

        Ok(ReplyWaiter::new(key, id, rx, self.clone()))
    }

    /// Match an inbound reply to its waiting request.
    ///
    /// Never fails: replies with no waiter are buffered (while a rename may
    /// still claim them) or discarded and counted.
    #[instrument(skip(self, reply), fields(key = %reply.correlation_key))]
    pub fn complete_by_key(&self, reply: ReplyMessage) -> ReplyOutcome {
        let now = Instant::now();
        let key = reply.correlation_key.clone();

        let (outcome, entry, pending) = {
            let mut state = self.lock();
            let (outcome, entry) = if let Some(entry) = state.take_entry_by_key(&key) {
                state.tombstone(key.clone(), EntryState::Completed, now);
                (ReplyOutcome::Delivered, Some(entry))
            } else if let Some(tombstone) = state.tombstones.get(&key) {
                let outcome = match tombstone.state {
                    EntryState::Completed => ReplyOutcome::Duplicate,
                    _ => ReplyOutcome::Unmatched,
                };
                (outcome, None)
            } else if state.early_replies.contains_key(&key) {
                (ReplyOutcome::Duplicate, None)
            } else if state.awaiting_send > 0 && !self.inner.early_reply_ttl.is_zero() {
                let limit = self.inner.max_buffered;
                if limit > 0 && state.early_replies.len() >= limit {
                    warn!(limit, "Early-reply buffer full, discarding reply");
                    (ReplyOutcome::Unmatched, None)
                } else {
                    state.buffer_reply(reply.clone(), now);
                    (ReplyOutcome::Buffered, None)
                }
            } else {
                (ReplyOutcome::Unmatched, None)
            };
            (outcome, entry, state.entries.len())
        };

        match (outcome, entry) {
            (ReplyOutcome::Delivered, Some(entry)) => {
                self.report_pending(pending);
                self.deliver(entry, reply, now);
            }
            (ReplyOutcome::Buffered, _) => {
                self.inner.stats.add_buffered(1);
                debug!("Buffered reply ahead of pending rename");
            }
            (ReplyOutcome::Duplicate, _) => {
                self.inner.stats.add_duplicates(1);
                debug!("Discarding duplicate reply");
            }
            _ => {
                self.inner.stats.add_unmatched(1);
                debug!("Discarding reply with no waiting request");
            }
        }
        metrics::record_reply(outcome.as_str());
        outcome
    }

    /// Move an entry from `old` to `new`, resetting its deadline.
    ///
    /// If a reply is already buffered under `new`, the entry is completed with
    /// it before returning. Fails with [`RegistryError::KeyInUse`] when `new`
    /// is live for a different request, leaving `old` authoritative.
    #[instrument(skip(self, deadline), fields(old = %old, new = %new))]
    pub fn rename_key(
        &self,
        old: &CorrelationKey,
        new: &CorrelationKey,
        deadline: Instant,
    ) -> Result<RenameOutcome, RegistryError> {
        let now = Instant::now();

        let (outcome, satisfied, pending) = {
            let mut state = self.lock();
            let (outcome, satisfied) = match state.keys.get(old).copied() {
                None => {
                    let terminal = state.tombstones.get(old).map(|t| t.state);
                    debug!(?terminal, "Rename for request that is no longer pending");
                    (RenameOutcome::Stale, None)
                }
                Some(id) => {
                    if let Some(other) = state.keys.get(new).copied() {
                        if other != id {
                            warn!("Assigned key already belongs to another pending request");
                            return Err(RegistryError::KeyInUse(new.clone()));
                        }
                    }

                    match state.early_replies.remove(new) {
                        Some(buffered) => {
                            let entry = state.take_entry(id);
                            // Both keys are terminal: echoes on either one are duplicates.
                            state.tombstone(old.clone(), EntryState::Completed, now);
                            state.tombstone(new.clone(), EntryState::Completed, now);
                            (
                                RenameOutcome::AlreadySatisfied,
                                entry.map(|e| (e, buffered.reply)),
                            )
                        }
                        None => {
                            state.mark_reply_expected(id);
                            state.relocate(id, new.clone());
                            state.reschedule(id, deadline);
                            (RenameOutcome::Relocated, None)
                        }
                    }
                }
            };
            (outcome, satisfied, state.entries.len())
        };

        match outcome {
            RenameOutcome::Relocated => {
                self.inner.stats.add_relocated(1);
                debug!("Relocated pending request to assigned key");
            }
            RenameOutcome::AlreadySatisfied => {
                self.inner.stats.add_already_satisfied(1);
                debug!("Reply arrived before rename, completing from buffer");
                if let Some((entry, reply)) = satisfied {
                    self.report_pending(pending);
                    self.deliver(entry, reply, now);
                }
            }
            RenameOutcome::Stale => self.inner.stats.add_stale_renames(1),
        }
        metrics::record_rename(outcome.as_str());
        Ok(outcome)
    }

    /// Record that the request under `key` was sent and stays correlated on that key.
    ///
    /// Returns false if no request is pending under `key`.
    #[instrument(skip(self), fields(key = %key))]
    pub fn mark_sent(&self, key: &CorrelationKey) -> bool {
        let found = {
            let mut state = self.lock();
            match state.keys.get(key).copied() {
                Some(id) => {
                    state.mark_reply_expected(id);
                    true
                }
                None => false,
            }
        };
        if found {
            self.inner.stats.add_kept_provisional(1);
            metrics::record_rename("kept_provisional");
        } else {
            debug!("Send completed for request that is no longer pending");
        }
        found
    }

    /// Remove every request whose deadline is at or before `now`.
    ///
    /// The caller is responsible for signalling the timeout on each returned
    /// continuation.
    pub fn expire_older_than(&self, now: Instant) -> Vec<ExpiredRequest> {
        let (expired, pending) = {
            let mut state = self.lock();
            let mut expired = Vec::new();
            loop {
                match state.deadlines.first() {
                    Some((deadline, _)) if *deadline <= now => {}
                    _ => break,
                }
                let Some((_, id)) = state.deadlines.pop_first() else {
                    break;
                };
                if let Some(entry) = state.take_entry(id) {
                    state.tombstone(entry.key.clone(), EntryState::Expired, now);
                    expired.push(ExpiredRequest {
                        key: entry.key,
                        waited: now.saturating_duration_since(entry.registered_at),
                        continuation: entry.continuation,
                    });
                }
            }
            (expired, state.entries.len())
        };

        if !expired.is_empty() {
            self.inner.stats.add_timeouts(expired.len() as u64);
            metrics::record_timeouts(expired.len() as u64);
            self.report_pending(pending);
            debug!(count = expired.len(), pending, "Expired pending requests");
        }
        expired
    }

    /// Drop tombstones and buffered replies older than their retention windows.
    ///
    /// Buffered replies that no rename claimed are counted as unmatched.
    pub fn purge_retained(&self, now: Instant) -> Purged {
        let (tombstones, unclaimed) = {
            let mut state = self.lock();
            let tombstones = match now.checked_sub(self.inner.tombstone_retention) {
                Some(cutoff) => state.purge_tombstones(cutoff),
                None => 0,
            };
            let unclaimed = match now.checked_sub(self.inner.early_reply_ttl) {
                Some(cutoff) => state.purge_early_replies(cutoff),
                None => Vec::new(),
            };
            (tombstones, unclaimed)
        };

        for key in &unclaimed {
            warn!(key = %key, "Dropping buffered reply that no request claimed");
        }
        if !unclaimed.is_empty() {
            self.inner.stats.add_unmatched(unclaimed.len() as u64);
        }

        Purged {
            tombstones,
            unclaimed_replies: unclaimed.len(),
        }
    }

    /// Cancel the request pending under `key`, resolving it with
    /// [`CorrelationError::Cancelled`].
    #[instrument(skip(self), fields(key = %key))]
    pub fn cancel(&self, key: &CorrelationKey) -> bool {
        let (entry, pending) = self.remove_by_key(key);
        match entry {
            Some(entry) => {
                self.inner.stats.add_cancelled(1);
                self.report_pending(pending);
                entry.continuation.fail(CorrelationError::Cancelled);
                debug!("Cancelled pending request");
                true
            }
            None => false,
        }
    }

    /// Remove an entry whose waiter was dropped.
    pub(crate) fn cancel_entry(&self, id: EntryId) {
        let (entry, pending) = {
            let mut state = self.lock();
            let entry = state.take_entry(id);
            (entry, state.entries.len())
        };
        if let Some(entry) = entry {
            self.inner.stats.add_cancelled(1);
            self.report_pending(pending);
            debug!(key = %entry.key, "Caller abandoned pending request");
        }
    }

    /// Resolve the request pending under `key` with `error`.
    #[instrument(skip(self, error), fields(key = %key))]
    pub fn fail(&self, key: &CorrelationKey, error: CorrelationError) -> bool {
        let (entry, pending) = self.remove_by_key(key);
        match entry {
            Some(entry) => {
                self.inner.stats.add_failed(1);
                self.report_pending(pending);
                debug!(error = %error, "Failing pending request");
                entry.continuation.fail(error);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with [`CorrelationError::Shutdown`] and
    /// discard buffered replies.
    pub fn close_all(&self) -> usize {
        let (entries, buffered) = {
            let mut state = self.lock();
            let entries: Vec<PendingEntry> = state.entries.drain().map(|(_, e)| e).collect();
            state.keys.clear();
            state.deadlines.clear();
            state.awaiting_send = 0;
            let buffered = state.early_replies.len();
            state.early_replies.clear();
            state.early_order.clear();
            (entries, buffered)
        };

        let count = entries.len();
        for entry in entries {
            entry.continuation.fail(CorrelationError::Shutdown);
        }
        self.inner.stats.add_failed(count as u64);
        self.inner.stats.add_unmatched(buffered as u64);
        self.report_pending(0);

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
        count
    }

    fn remove_by_key(&self, key: &CorrelationKey) -> (Option<PendingEntry>, usize) {
        let mut state = self.lock();
        let entry = state.take_entry_by_key(key);
        (entry, state.entries.len())
    }

    fn deliver(&self, entry: PendingEntry, reply: ReplyMessage, now: Instant) {
        self.inner.stats.add_delivered(1);
        let elapsed = now.saturating_duration_since(entry.registered_at);
        metrics::record_round_trip(elapsed.as_secs_f64() * 1000.0);
        if !entry.continuation.complete(reply) {
            debug!(key = %entry.key, "Caller went away before its reply was delivered");
        }
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether a request is pending under `key`.
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.lock().keys.contains_key(key)
    }

    /// Current state of the request last seen under `key`.
    ///
    /// Terminal states are reported while the key's tombstone is retained.
    pub fn state_of(&self, key: &CorrelationKey) -> Option<EntryState> {
        let state = self.lock();
        if let Some(id) = state.keys.get(key) {
            return state.entries.get(id).map(|e| e.state);
        }
        state.tombstones.get(key).map(|t| t.state)
    }

    /// Which flavor of key the request under `key` is live under.
    pub fn key_kind(&self, key: &CorrelationKey) -> Option<KeyKind> {
        let state = self.lock();
        let id = state.keys.get(key)?;
        state.entries.get(id).map(|e| e.kind)
    }

    /// Last count published to the `correlation.pending` gauge.
    pub fn reported_pending(&self) -> usize {
        self.inner.reported_pending.load(Ordering::Relaxed)
    }

    /// Number of replies currently buffered ahead of a rename.
    pub fn buffered_count(&self) -> usize {
        self.lock().early_replies.len()
    }

    /// Snapshot of the outcome counters.
    pub fn stats(&self) -> StatsSnapshot {
        let pending = self.pending_count();
        self.inner.stats.snapshot(pending)
    }
}

impl fmt::Debug for PendingReplyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReplyRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
