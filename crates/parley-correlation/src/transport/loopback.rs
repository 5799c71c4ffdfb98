//! In-memory broker.
//!
//! Destinations are bound to responder functions. Every accepted message gets
//! a broker-assigned id, a send notification, and (if the responder produces
//! one) a reply published on the reply channel. Timing and failure knobs make
//! the rename race reproducible.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, instrument, trace};

use super::{MessageSentCallback, OutboundMessage, ReplyMessage, ReplySender, Transport};
use crate::error::TransportError;
use crate::key::CorrelationKey;

/// Produces the reply body for a request, or `None` for no reply.
pub type Responder = Arc<dyn Fn(&OutboundMessage) -> Option<Bytes> + Send + Sync>;

/// Timing and fault injection for [`LoopbackBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackBehavior {
    /// Delay between accepting a message and "physically" sending it
    pub send_delay: Duration,
    /// Delay between the send notification and the reply (or the reverse with `reply_first`)
    pub reply_delay: Duration,
    /// Report the broker message id in the send notification
    pub assign_ids: bool,
    /// Report a failure to read back the message id instead of the id
    pub fail_assignment: bool,
    /// Publish the reply before firing the send notification
    pub reply_first: bool,
    /// Publish every reply twice
    pub duplicate_replies: bool,
    /// Drop every n-th reply
    pub drop_every: Option<u64>,
    /// Tag replies with the caller's provisional key instead of the broker id
    pub echo_provisional: bool,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            send_delay: Duration::ZERO,
            reply_delay: Duration::ZERO,
            assign_ids: true,
            fail_assignment: false,
            reply_first: false,
            duplicate_replies: false,
            drop_every: None,
            echo_provisional: false,
        }
    }
}

/// A [`Transport`] that loops requests back to in-process responders.
pub struct LoopbackBroker {
    destinations: DashMap<String, Responder>,
    replies: ReplySender,
    behavior: LoopbackBehavior,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LoopbackBroker {
    pub fn new(replies: ReplySender, behavior: LoopbackBehavior) -> Self {
        Self {
            destinations: DashMap::new(),
            replies,
            behavior,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind a responder to a destination, replacing any previous binding.
    ///
    /// Returns true if a binding was replaced.
    #[instrument(skip(self, responder), fields(destination = %destination))]
    pub fn bind<F>(&self, destination: &str, responder: F) -> bool
    where
        F: Fn(&OutboundMessage) -> Option<Bytes> + Send + Sync + 'static,
    {
        let replaced = self
            .destinations
            .insert(destination.to_string(), Arc::new(responder))
            .is_some();
        debug!(replaced, "Bound loopback destination");
        replaced
    }

    /// Bind a destination that replies with the request payload.
    pub fn bind_echo(&self, destination: &str) -> bool {
        self.bind(destination, |message| Some(message.payload.clone()))
    }

    pub fn unbind(&self, destination: &str) -> bool {
        self.destinations.remove(destination).is_some()
    }

    pub fn is_bound(&self, destination: &str) -> bool {
        self.destinations.contains_key(destination)
    }

    /// Number of messages accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Stop accepting messages.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn behavior(&self) -> &LoopbackBehavior {
        &self.behavior
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    async fn send(
        &self,
        message: OutboundMessage,
        on_sent: Box<dyn MessageSentCallback>,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let responder = self
            .destinations
            .get(&message.destination)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::unknown_destination(&message.destination))?;

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = format!("ID:loopback-{seq}");
        let reply_key = if self.behavior.echo_provisional {
            message.correlation_key.clone()
        } else {
            CorrelationKey::from(message_id.as_str())
        };
        let assigned = if self.behavior.fail_assignment {
            Err(TransportError::assignment_unavailable(format!(
                "{message_id} not readable after send"
            )))
        } else {
            Ok(self.behavior.assign_ids.then_some(message_id))
        };
        let dropped = self
            .behavior
            .drop_every
            .is_some_and(|n| n > 0 && seq % n == 0);

        let replies = self.replies.clone();
        let behavior = self.behavior.clone();

        tokio::spawn(async move {
            pause(behavior.send_delay).await;
            let reply = responder(&message).map(|payload| ReplyMessage {
                correlation_key: reply_key,
                payload,
            });

            if behavior.reply_first {
                publish(&replies, reply, &behavior, dropped).await;
                pause(behavior.reply_delay).await;
                on_sent.sent(assigned);
            } else {
                on_sent.sent(assigned);
                pause(behavior.reply_delay).await;
                publish(&replies, reply, &behavior, dropped).await;
            }
        });

        Ok(())
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

async fn publish(
    replies: &ReplySender,
    reply: Option<ReplyMessage>,
    behavior: &LoopbackBehavior,
    dropped: bool,
) {
    let Some(reply) = reply else {
        return;
    };
    if dropped {
        debug!(key = %reply.correlation_key, "Loopback dropping reply");
        return;
    }

    let copies = if behavior.duplicate_replies { 2 } else { 1 };
    for _ in 0..copies {
        if replies.send(reply.clone()).await.is_err() {
            trace!("Reply channel closed, discarding loopback reply");
            return;
        }
    }
}

impl fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("destinations", &self.destinations.len())
            .field("behavior", &self.behavior)
            .field("sent", &self.sent_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::reply_channel;
    use tokio::sync::oneshot;

    struct Recorder(oneshot::Sender<Result<Option<String>, TransportError>>);

    impl MessageSentCallback for Recorder {
        fn sent(self: Box<Self>, assigned: Result<Option<String>, TransportError>) {
            let _ = self.0.send(assigned);
        }
    }

    fn recorder() -> (
        Box<dyn MessageSentCallback>,
        oneshot::Receiver<Result<Option<String>, TransportError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (Box::new(Recorder(tx)), rx)
    }

    fn request(destination: &str, key: &str) -> OutboundMessage {
        OutboundMessage {
            correlation_key: CorrelationKey::from(key),
            destination: destination.to_string(),
            payload: Bytes::from_static(b"ping"),
        }
    }

    #[tokio::test]
    async fn test_assigns_id_and_replies_on_it() {
        let (tx, mut rx) = reply_channel(8);
        let broker = LoopbackBroker::new(tx, LoopbackBehavior::default());
        broker.bind_echo("echo");

        let (callback, sent) = recorder();
        broker.send(request("echo", "P1"), callback).await.unwrap();

        assert_eq!(sent.await.unwrap(), Ok(Some("ID:loopback-1".to_string())));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.correlation_key.as_str(), "ID:loopback-1");
        assert_eq!(reply.payload.as_ref(), b"ping");
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let (tx, _rx) = reply_channel(8);
        let broker = LoopbackBroker::new(tx, LoopbackBehavior::default());

        let (callback, _sent) = recorder();
        let err = broker.send(request("nowhere", "P1"), callback).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownDestination("nowhere".to_string()));
        assert_eq!(broker.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects() {
        let (tx, _rx) = reply_channel(8);
        let broker = LoopbackBroker::new(tx, LoopbackBehavior::default());
        broker.bind_echo("echo");
        broker.close();

        let (callback, _sent) = recorder();
        assert_eq!(
            broker.send(request("echo", "P1"), callback).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_echo_provisional_without_ids() {
        let (tx, mut rx) = reply_channel(8);
        let behavior = LoopbackBehavior {
            assign_ids: false,
            echo_provisional: true,
            ..Default::default()
        };
        let broker = LoopbackBroker::new(tx, behavior);
        broker.bind("upper", |m| {
            Some(Bytes::from(m.payload.to_ascii_uppercase()))
        });

        let (callback, sent) = recorder();
        broker.send(request("upper", "P7"), callback).await.unwrap();

        assert_eq!(sent.await.unwrap(), Ok(None));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.correlation_key.as_str(), "P7");
        assert_eq!(reply.payload.as_ref(), b"PING");
    }

    #[tokio::test]
    async fn test_duplicates_and_drops() {
        let (tx, mut rx) = reply_channel(8);
        let behavior = LoopbackBehavior {
            duplicate_replies: true,
            drop_every: Some(2),
            ..Default::default()
        };
        let broker = LoopbackBroker::new(tx, behavior);
        broker.bind_echo("echo");

        let (first, first_sent) = recorder();
        broker.send(request("echo", "P1"), first).await.unwrap();
        first_sent.await.unwrap().unwrap();
        let (second, second_sent) = recorder();
        broker.send(request("echo", "P2"), second).await.unwrap();
        second_sent.await.unwrap().unwrap();

        // First message replied twice, second dropped.
        assert_eq!(rx.recv().await.unwrap().correlation_key.as_str(), "ID:loopback-1");
        assert_eq!(rx.recv().await.unwrap().correlation_key.as_str(), "ID:loopback-1");
        drop(broker);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .map(|r| r.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_failed_assignment_reported() {
        let (tx, mut rx) = reply_channel(8);
        let behavior = LoopbackBehavior {
            fail_assignment: true,
            echo_provisional: true,
            ..Default::default()
        };
        let broker = LoopbackBroker::new(tx, behavior);
        broker.bind_echo("echo");

        let (callback, sent) = recorder();
        broker.send(request("echo", "P4"), callback).await.unwrap();

        assert!(matches!(
            sent.await.unwrap(),
            Err(TransportError::AssignmentUnavailable(_))
        ));
        assert_eq!(rx.recv().await.unwrap().correlation_key.as_str(), "P4");
    }

    #[test]
    fn test_bind_replaces() {
        let (tx, _rx) = reply_channel(8);
        let broker = LoopbackBroker::new(tx, LoopbackBehavior::default());
        assert!(!broker.bind_echo("echo"));
        assert!(broker.bind_echo("echo"));
        assert!(broker.is_bound("echo"));
        assert!(broker.unbind("echo"));
        assert!(!broker.is_bound("echo"));
    }
}
