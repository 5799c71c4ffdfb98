//! Caller-facing request API.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::{CorrelationConfig, CorrelationMode};
use crate::error::CorrelationError;
use crate::key::CorrelationKey;
use crate::registry::{PendingReplyRegistry, ReplyWaiter};
use crate::rename;
use crate::transport::{OutboundMessage, ReplyMessage, Transport};

/// Sends requests through a [`Transport`] and hands back awaitable replies.
///
/// The sending task never waits for the reply: [`Requester::send`] returns as
/// soon as the transport accepted the message.
pub struct Requester<T: Transport> {
    registry: PendingReplyRegistry,
    transport: Arc<T>,
    mode: CorrelationMode,
    default_timeout: Duration,
}

impl<T: Transport> Requester<T> {
    pub fn new(registry: PendingReplyRegistry, transport: Arc<T>, config: &CorrelationConfig) -> Self {
        Self {
            registry,
            transport,
            mode: config.mode,
            default_timeout: config.request_timeout(),
        }
    }

    /// Send a request and return the waiter for its reply.
    ///
    /// `timeout` defaults to the configured request timeout. If the transport
    /// rejects the message the request is failed and the error returned.
    #[instrument(skip(self, payload))]
    pub async fn send(
        &self,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ReplyWaiter, CorrelationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let key = CorrelationKey::provisional();
        let waiter = self.registry.register(key.clone(), Instant::now() + timeout)?;

        let on_sent = rename::sent_callback(self.mode, self.registry.clone(), key.clone(), timeout);
        let message = OutboundMessage {
            correlation_key: key.clone(),
            destination: destination.to_string(),
            payload: payload.into(),
        };

        if let Err(error) = self.transport.send(message, on_sent).await {
            warn!(key = %key, error = %error, "Transport rejected request");
            self.registry
                .fail(&key, CorrelationError::SendFailed(error.clone()));
            return Err(CorrelationError::SendFailed(error));
        }

        debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "Request handed to transport");
        Ok(waiter)
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &self,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ReplyMessage, CorrelationError> {
        self.send(destination, payload, timeout).await?.await
    }

    pub fn registry(&self) -> &PendingReplyRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T: Transport> Clone for Requester<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            transport: Arc::clone(&self.transport),
            mode: self.mode,
            default_timeout: self.default_timeout,
        }
    }
}

impl<T: Transport> fmt::Debug for Requester<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("mode", &self.mode)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::MessageSentCallback;
    use async_trait::async_trait;

    /// Accepts nothing.
    struct RejectingTransport;

    #[async_trait]
    impl Transport for RejectingTransport {
        async fn send(
            &self,
            message: OutboundMessage,
            _on_sent: Box<dyn MessageSentCallback>,
        ) -> Result<(), TransportError> {
            Err(TransportError::unknown_destination(message.destination))
        }
    }

    #[tokio::test]
    async fn test_rejected_send_fails_request() {
        let registry = PendingReplyRegistry::new(&CorrelationConfig::default());
        let requester = Requester::new(
            registry.clone(),
            Arc::new(RejectingTransport),
            &CorrelationConfig::default(),
        );

        let err = requester.send("orders", "ping", None).await.unwrap_err();
        assert_eq!(
            err,
            CorrelationError::SendFailed(TransportError::UnknownDestination("orders".into()))
        );
        assert_eq!(registry.pending_count(), 0);

        let stats = registry.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test]
    async fn test_capacity_error_surfaces() {
        let config = CorrelationConfig {
            max_pending: 1,
            ..Default::default()
        };
        let registry = PendingReplyRegistry::new(&config);
        let _held = registry
            .register("held".into(), Instant::now() + Duration::from_secs(5))
            .unwrap();
        let requester = Requester::new(registry, Arc::new(RejectingTransport), &config);

        let err = requester.send("orders", "ping", None).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Registry(_)));
    }
}
