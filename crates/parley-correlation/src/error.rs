//! Error types for the correlation engine.

use std::time::Duration;

use thiserror::Error;

use crate::key::CorrelationKey;

/// Failure delivered to a caller waiting on a reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// No reply arrived before the request deadline
    #[error("Timed out after {waited:?} waiting for a reply to {key}")]
    Timeout {
        /// Key the request was live under when it expired
        key: CorrelationKey,
        /// Time between registration and expiry
        waited: Duration,
    },

    /// The transport refused or failed to send the request
    #[error("Send failed: {0}")]
    SendFailed(#[from] TransportError),

    /// The request was cancelled before a reply arrived
    #[error("Request cancelled")]
    Cancelled,

    /// The engine shut down while the request was pending
    #[error("Correlation engine shut down")]
    Shutdown,

    /// The request could not be registered
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl CorrelationError {
    /// Whether this failure is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors returned by the pending-reply registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Correlation key already in use: {0}")]
    KeyInUse(CorrelationKey),

    #[error("Registry at capacity ({0} pending requests)")]
    AtCapacity(usize),
}

/// Errors reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The message was sent but the transport could not report the id it assigned
    #[error("Assigned message id unavailable: {0}")]
    AssignmentUnavailable(String),

    /// Nothing is bound to the destination
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// The transport is closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Create a new assignment-unavailable error.
    pub fn assignment_unavailable(msg: impl Into<String>) -> Self {
        Self::AssignmentUnavailable(msg.into())
    }

    /// Create a new unknown-destination error.
    pub fn unknown_destination(destination: impl Into<String>) -> Self {
        Self::UnknownDestination(destination.into())
    }
}
