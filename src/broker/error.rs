//! Error types for the broker publisher
//!
//! [`BrokerError`] is what callers see. Its variants follow the phase that
//! failed: connect, channel open, queue declaration, encoding, publish.
//! [`TransportError`] is the raw cause reported by a broker implementation and
//! is wrapped by the phase that observed it.

use std::time::Duration;
use thiserror::Error;

use crate::telemetry::EventError;

/// Failure reported by a broker transport (AMQP client or in-memory broker).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Dial failed: refused, DNS, TLS or authentication
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The connection or channel is no longer usable
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The broker rejected the operation
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Why a serialized message did not reach the broker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishFailure {
    #[error("broker did not accept the message within {0:?}")]
    TimedOut(Duration),

    #[error("publish cancelled by caller")]
    Cancelled,

    /// The connection manager has been closed
    #[error("channel unavailable")]
    ChannelUnavailable,

    #[error(transparent)]
    Transport(TransportError),
}

/// Errors surfaced by the connection manager and publisher.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// Cannot reach or authenticate against the broker
    #[error("failed to connect to broker at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: TransportError,
    },

    /// Connection is up but a channel could not be opened or was lost
    #[error("channel error: {0}")]
    Channel(#[source] TransportError),

    #[error("failed to declare queue {queue}: {source}")]
    QueueDeclaration {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("failed to publish message: {0}")]
    Publish(#[source] PublishFailure),
}

impl BrokerError {
    /// Only publish failures are worth another attempt; everything else
    /// fails again the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Publish(_))
    }
}

impl From<EventError> for BrokerError {
    fn from(e: EventError) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}
