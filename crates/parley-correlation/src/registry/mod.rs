//! Pending-Reply Registry.
//!
//! Maps the live correlation key of every in-flight request to the
//! continuation that resolves the caller's [`ReplyWaiter`].
//!
//! ## Architecture
//!
//! The send path registers a request under a provisional key. The transport's
//! send notification may rename it to the id the broker assigned. Replies and
//! the expiry sweeper race to resolve it; whichever removes the entry first
//! owns the continuation.
//!
//! ```text
//! Requester --register(P)--> PendingReplyRegistry <--complete_by_key(A)-- ReplyDispatcher
//!                                 ^        ^
//!     SentCallback --rename(P, A)-+        +--expire_older_than(now)-- ExpirySweeper
//! ```
//!
//! Replies that arrive under an assigned key before the rename are buffered
//! for a short time so the rename can claim them.

mod continuation;
mod pending_registry;

pub use continuation::{Continuation, ExpiredRequest, ReplyWaiter};
pub use pending_registry::{EntryState, PendingReplyRegistry, Purged, RenameOutcome, ReplyOutcome};
