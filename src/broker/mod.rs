//! # Broker Publisher
//!
//! Hands telemetry events to a durable broker queue. This is the only part of
//! the service with real protocol concerns: connection setup, channel and
//! queue declaration, deadline-bounded publish and teardown.
//!
//! ## Module Architecture
//!
//! ```text
//! broker/
//! ├── transport.rs   - broker seam (connector, connection, channel traits)
//! ├── amqp.rs        - lapin-backed AMQP 0-9-1 transport
//! ├── memory.rs      - in-process transport for tests and local runs
//! ├── connection.rs  - connection manager (open / close)
//! ├── publisher.rs   - deadline-bounded publish
//! ├── retry.rs       - optional retry decorator
//! └── error.rs       - error kinds
//! ```
//!
//! ## Flow
//!
//! ```text
//! HTTP handler ──► TelemetrySink ──► Publisher ──► ConnectionManager ──► BrokerChannel
//!                  (retry optional)   (5s deadline)  (mutex-guarded session)
//! ```
//!
//! The connection manager is opened once at startup and shared by every
//! publisher clone through an `Arc`. A broken connection is not re-dialed:
//! subsequent publishes fail until the process restarts.

pub mod amqp;
pub mod connection;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod transport;

pub use amqp::AmqpConnector;
pub use connection::{ConnectionManager, DEFAULT_DIAL_TIMEOUT};
pub use error::{BrokerError, PublishFailure, TransportError};
pub use memory::MemoryBroker;
pub use publisher::{Publisher, TelemetrySink, DEFAULT_PUBLISH_TIMEOUT};
pub use retry::{RetryPolicy, RetryingPublisher};
pub use transport::{BrokerConnector, QueueSpec};

/// Picks the transport for a broker URL by scheme.
pub fn connector_for(url: &str) -> Option<Box<dyn BrokerConnector>> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme)?;
    match scheme {
        "amqp" | "amqps" => Some(Box::new(AmqpConnector)),
        "memory" => Some(Box::new(MemoryBroker::new())),
        _ => None,
    }
}
