//! Send-completion callbacks.
//!
//! Once the transport has physically sent a request it reports the id it
//! assigned. [`UseAssignedIdCallback`] re-keys the pending entry to that id so
//! replies correlated on the broker's message id find their waiter.
//! [`KeepProvisionalCallback`] is used when replies echo the caller's own key.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CorrelationMode;
use crate::error::TransportError;
use crate::key::CorrelationKey;
use crate::registry::{PendingReplyRegistry, RenameOutcome};
use crate::transport::MessageSentCallback;

/// What a send notification did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentOutcome {
    /// The registry processed a rename
    Renamed(RenameOutcome),
    /// The provisional key stays authoritative
    KeptProvisional,
    /// No request is pending under the provisional key any more
    NotPending,
}

/// Re-keys a pending request to the id the transport assigned on send.
#[derive(Debug)]
pub struct UseAssignedIdCallback {
    registry: PendingReplyRegistry,
    provisional: CorrelationKey,
    request_timeout: Duration,
}

impl UseAssignedIdCallback {
    pub fn new(
        registry: PendingReplyRegistry,
        provisional: CorrelationKey,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            provisional,
            request_timeout,
        }
    }

    /// Apply the send notification.
    ///
    /// A missing or unreadable assigned id is not an error: the provisional
    /// key simply remains the correlation key.
    pub fn on_sent(self, assigned: Result<Option<String>, TransportError>) -> SentOutcome {
        let assigned = match assigned {
            Ok(Some(id)) => CorrelationKey::from(id),
            Ok(None) => {
                debug!(key = %self.provisional, "Transport assigned no message id, keeping provisional key");
                return keep_provisional(&self.registry, &self.provisional);
            }
            Err(error) => {
                debug!(key = %self.provisional, error = %error, "Could not read assigned message id, keeping provisional key");
                return keep_provisional(&self.registry, &self.provisional);
            }
        };

        let deadline = Instant::now() + self.request_timeout;
        match self
            .registry
            .rename_key(&self.provisional, &assigned, deadline)
        {
            Ok(outcome) => SentOutcome::Renamed(outcome),
            Err(error) => {
                warn!(
                    key = %self.provisional,
                    assigned = %assigned,
                    error = %error,
                    "Rename rejected, keeping provisional key"
                );
                keep_provisional(&self.registry, &self.provisional)
            }
        }
    }
}

impl MessageSentCallback for UseAssignedIdCallback {
    fn sent(self: Box<Self>, assigned: Result<Option<String>, TransportError>) {
        self.on_sent(assigned);
    }
}

/// Marks a request as sent while it stays correlated on its provisional key.
#[derive(Debug)]
pub struct KeepProvisionalCallback {
    registry: PendingReplyRegistry,
    provisional: CorrelationKey,
}

impl KeepProvisionalCallback {
    pub fn new(registry: PendingReplyRegistry, provisional: CorrelationKey) -> Self {
        Self {
            registry,
            provisional,
        }
    }

    pub fn on_sent(self, _assigned: Result<Option<String>, TransportError>) -> SentOutcome {
        keep_provisional(&self.registry, &self.provisional)
    }
}

impl MessageSentCallback for KeepProvisionalCallback {
    fn sent(self: Box<Self>, assigned: Result<Option<String>, TransportError>) {
        self.on_sent(assigned);
    }
}

fn keep_provisional(registry: &PendingReplyRegistry, key: &CorrelationKey) -> SentOutcome {
    if registry.mark_sent(key) {
        SentOutcome::KeptProvisional
    } else {
        SentOutcome::NotPending
    }
}

/// Build the send callback for `mode`.
pub fn sent_callback(
    mode: CorrelationMode,
    registry: PendingReplyRegistry,
    provisional: CorrelationKey,
    request_timeout: Duration,
) -> Box<dyn MessageSentCallback> {
    match mode {
        CorrelationMode::Provisional => {
            Box::new(KeepProvisionalCallback::new(registry, provisional))
        }
        CorrelationMode::TransportAssigned => Box::new(UseAssignedIdCallback::new(
            registry,
            provisional,
            request_timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelationConfig;
    use crate::registry::EntryState;
    use crate::transport::ReplyMessage;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn setup(key: &str) -> (PendingReplyRegistry, crate::registry::ReplyWaiter) {
        let registry = PendingReplyRegistry::new(&CorrelationConfig::default());
        let waiter = registry
            .register(CorrelationKey::from(key), Instant::now() + TIMEOUT)
            .unwrap();
        (registry, waiter)
    }

    #[tokio::test]
    async fn test_assigned_id_renames_entry() {
        let (registry, waiter) = setup("P1");
        let callback = UseAssignedIdCallback::new(registry.clone(), "P1".into(), TIMEOUT);

        let outcome = callback.on_sent(Ok(Some("ID:A1".to_string())));
        assert_eq!(outcome, SentOutcome::Renamed(RenameOutcome::Relocated));
        assert!(registry.contains(&"ID:A1".into()));

        registry.complete_by_key(ReplyMessage::new("ID:A1", "pong"));
        assert_eq!(waiter.await.unwrap().payload.as_ref(), b"pong");
    }

    #[tokio::test]
    async fn test_missing_id_keeps_provisional_key() {
        let (registry, waiter) = setup("P1");
        let callback = UseAssignedIdCallback::new(registry.clone(), "P1".into(), TIMEOUT);

        assert_eq!(callback.on_sent(Ok(None)), SentOutcome::KeptProvisional);
        assert_eq!(
            registry.state_of(&"P1".into()),
            Some(EntryState::AwaitingReply)
        );

        registry.complete_by_key(ReplyMessage::new("P1", "pong"));
        assert!(waiter.await.is_ok());
    }

    #[test]
    fn test_unreadable_id_keeps_provisional_key() {
        let (registry, _waiter) = setup("P1");
        let callback = UseAssignedIdCallback::new(registry.clone(), "P1".into(), TIMEOUT);

        let outcome = callback.on_sent(Err(TransportError::assignment_unavailable(
            "message id header missing",
        )));
        assert_eq!(outcome, SentOutcome::KeptProvisional);
        assert!(registry.contains(&"P1".into()));
        assert_eq!(registry.stats().kept_provisional, 1);
    }

    #[test]
    fn test_rejected_rename_keeps_provisional_key() {
        let (registry, _waiter) = setup("P1");
        let _other = registry
            .register("ID:taken".into(), Instant::now() + TIMEOUT)
            .unwrap();
        let callback = UseAssignedIdCallback::new(registry.clone(), "P1".into(), TIMEOUT);

        let outcome = callback.on_sent(Ok(Some("ID:taken".to_string())));
        assert_eq!(outcome, SentOutcome::KeptProvisional);
        assert_eq!(
            registry.state_of(&"P1".into()),
            Some(EntryState::AwaitingReply)
        );
    }

    #[test]
    fn test_notification_after_cancel() {
        let (registry, waiter) = setup("P1");
        drop(waiter);

        let callback = UseAssignedIdCallback::new(registry.clone(), "P1".into(), TIMEOUT);
        assert_eq!(
            callback.on_sent(Ok(Some("ID:A1".to_string()))),
            SentOutcome::Renamed(RenameOutcome::Stale)
        );
        assert!(!registry.contains(&"ID:A1".into()));
    }

    #[test]
    fn test_keep_provisional_ignores_assigned_id() {
        let (registry, _waiter) = setup("P1");
        let callback = KeepProvisionalCallback::new(registry.clone(), "P1".into());

        assert_eq!(
            callback.on_sent(Ok(Some("ID:A1".to_string()))),
            SentOutcome::KeptProvisional
        );
        assert!(registry.contains(&"P1".into()));
        assert!(!registry.contains(&"ID:A1".into()));
    }

    #[test]
    fn test_boxed_callback_dispatch() {
        let (registry, _waiter) = setup("P1");
        let callback = sent_callback(
            CorrelationMode::TransportAssigned,
            registry.clone(),
            "P1".into(),
            TIMEOUT,
        );

        callback.sent(Ok(Some("ID:A1".to_string())));
        assert!(registry.contains(&"ID:A1".into()));
    }
}
