//! Per-outcome counters kept by the registry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct CorrelationStats {
    registered: AtomicU64,
    delivered: AtomicU64,
    relocated: AtomicU64,
    already_satisfied: AtomicU64,
    stale_renames: AtomicU64,
    kept_provisional: AtomicU64,
    buffered: AtomicU64,
    duplicates: AtomicU64,
    unmatched: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl CorrelationStats {
    counter! {
        add_registered => registered,
        add_delivered => delivered,
        add_relocated => relocated,
        add_already_satisfied => already_satisfied,
        add_stale_renames => stale_renames,
        add_kept_provisional => kept_provisional,
        add_buffered => buffered,
        add_duplicates => duplicates,
        add_unmatched => unmatched,
        add_timeouts => timeouts,
        add_cancelled => cancelled,
        add_failed => failed,
    }

    pub(crate) fn snapshot(&self, pending: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            pending,
            registered: load(&self.registered),
            delivered: load(&self.delivered),
            relocated: load(&self.relocated),
            already_satisfied: load(&self.already_satisfied),
            stale_renames: load(&self.stale_renames),
            kept_provisional: load(&self.kept_provisional),
            buffered: load(&self.buffered),
            duplicates: load(&self.duplicates),
            unmatched: load(&self.unmatched),
            timeouts: load(&self.timeouts),
            cancelled: load(&self.cancelled),
            failed: load(&self.failed),
        }
    }
}

/// Point-in-time copy of the registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Requests currently waiting
    pub pending: usize,
    /// Requests registered since start
    pub registered: u64,
    /// Replies handed to a waiting caller (including early replies claimed on rename)
    pub delivered: u64,
    /// Renames that moved an entry to its assigned key
    pub relocated: u64,
    /// Renames that found the reply already buffered
    pub already_satisfied: u64,
    /// Renames for entries that were already gone
    pub stale_renames: u64,
    /// Send notifications that kept the provisional key live
    pub kept_provisional: u64,
    /// Replies held for a rename that had not happened yet
    pub buffered: u64,
    /// Replies for a key that was already completed
    pub duplicates: u64,
    /// Replies that never matched a waiter
    pub unmatched: u64,
    /// Requests failed by the expiry sweeper
    pub timeouts: u64,
    /// Requests abandoned by their caller
    pub cancelled: u64,
    /// Requests failed for any other reason (send failure, shutdown)
    pub failed: u64,
}

impl StatsSnapshot {
    /// Number of requests that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.delivered + self.timeouts + self.cancelled + self.failed
    }
}
