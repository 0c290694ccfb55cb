//! Broker seam
//!
//! The connection manager only talks to the broker through these traits. The
//! AMQP client ([`super::amqp`]) and the in-process broker ([`super::memory`])
//! both implement them, which keeps the manager and publisher testable without
//! a running RabbitMQ.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::TransportError;

pub type TransportResult<T> = Result<T, TransportError>;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Parameters for the single queue the publisher writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Survives broker restart, shared, never auto-deleted.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// AMQP `delivery-mode` value asking the broker to write the message to disk
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: u8,
    pub timestamp: DateTime<Utc>,
}

impl MessageProperties {
    /// Durable JSON message stamped with the given publish time.
    pub fn persistent_json(timestamp: DateTime<Utc>) -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            timestamp,
        }
    }
}

/// A message routed straight to a queue through the default exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Dials a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn BrokerConnection>>;
}

/// An established physical connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>>;

    /// Closing an already broken connection may fail; callers log and move on.
    async fn close(&self) -> TransportResult<()>;

    fn is_connected(&self) -> bool;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent for identical parameters.
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()>;

    /// Resolves once the broker client has accepted the message for delivery.
    async fn publish(&self, message: OutboundMessage) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    /// False once either side has closed the channel.
    fn is_open(&self) -> bool;
}

/// Hides the password part of a broker URL for logging.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    match authority.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}{path}")
        }
        None => url.to_string(),
    }
}
