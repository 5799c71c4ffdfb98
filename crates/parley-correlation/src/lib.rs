//! # parley-correlation
//!
//! Asynchronous request/reply correlation over message brokers.
//!
//! A caller sends a request and gets back a [`ReplyWaiter`] without blocking
//! the sending task. The reply is matched to the waiter by correlation key,
//! arriving on a different task at any later time.
//!
//! ## Architecture
//!
//! - **Registry**: pending requests by correlation key, with deadlines
//! - **Rename protocol**: moves an entry from its provisional key to the key the
//!   transport assigned once the physical send completes
//! - **Dispatcher**: matches inbound replies against the registry
//! - **Sweeper**: fails requests whose deadline passed
//! - **Engine**: owns the dispatcher and sweeper tasks
//!
//! ## Correlation modes
//!
//! - `transport_assigned`: the responder replies with the broker's message id
//! - `provisional`: the responder echoes the key generated before sending

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod metrics;
pub mod registry;
pub mod rename;
pub mod requester;
pub mod sweeper;
pub mod transport;

mod error;
mod key;
mod stats;

pub use config::{CorrelationConfig, CorrelationMode};
pub use dispatcher::ReplyDispatcher;
pub use engine::CorrelationEngine;
pub use error::{CorrelationError, RegistryError, TransportError};
pub use key::{CorrelationKey, KeyKind};
pub use registry::{
    EntryState, PendingReplyRegistry, RenameOutcome, ReplyOutcome, ReplyWaiter,
};
pub use rename::{sent_callback, SentOutcome};
pub use requester::Requester;
pub use stats::StatsSnapshot;
pub use sweeper::{ExpirySweeper, SweepReport};
pub use transport::{
    reply_channel, LoopbackBehavior, LoopbackBroker, MessageSentCallback, OutboundMessage,
    ReplyMessage, Transport,
};
