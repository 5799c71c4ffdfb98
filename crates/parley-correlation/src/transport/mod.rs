//! Transport boundary.
//!
//! The engine never talks to a broker directly. A [`Transport`] accepts
//! outbound messages and reports back through two contracts:
//!
//! - a [`MessageSentCallback`] invoked once the message was physically sent,
//!   carrying whatever identifier the transport assigned to it;
//! - a stream of [`ReplyMessage`]s pushed into the reply channel.
//!
//! ```text
//! Requester --send--> Transport --sent(id)--> MessageSentCallback --> PendingReplyRegistry
//!                         |                                                  ^
//!                         +--> ReplySender --> ReplyDispatcher --------------+
//! ```

mod loopback;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::key::CorrelationKey;

pub use loopback::{LoopbackBehavior, LoopbackBroker, Responder};

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Provisional key generated for this request
    pub correlation_key: CorrelationKey,
    /// Destination (queue or topic) the request is addressed to
    pub destination: String,
    /// Serialized request body
    pub payload: Bytes,
}

/// A reply received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    /// Identifier the reply is correlated on
    pub correlation_key: CorrelationKey,
    /// Serialized reply body
    pub payload: Bytes,
}

impl ReplyMessage {
    pub fn new(correlation_key: impl Into<CorrelationKey>, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            payload: payload.into(),
        }
    }
}

/// Notification fired by the transport after a message was physically sent.
///
/// `assigned` carries the identifier the transport gave the message,
/// `Ok(None)` when it assigns none, or an error when it failed to read it back.
/// Taking `self: Box<Self>` makes the notification single-shot.
pub trait MessageSentCallback: Send + 'static {
    fn sent(self: Box<Self>, assigned: Result<Option<String>, TransportError>);
}

/// Outbound side of a message broker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue a message for sending.
    ///
    /// Returning `Ok` means the transport accepted the message and will invoke
    /// `on_sent` after physical transmission. An `Err` means the message will
    /// not be sent and `on_sent` is dropped without being called.
    async fn send(
        &self,
        message: OutboundMessage,
        on_sent: Box<dyn MessageSentCallback>,
    ) -> Result<(), TransportError>;
}

pub type ReplySender = mpsc::Sender<ReplyMessage>;

pub type ReplyReceiver = mpsc::Receiver<ReplyMessage>;

pub fn reply_channel(buffer: usize) -> (ReplySender, ReplyReceiver) {
    mpsc::channel(buffer)
}
