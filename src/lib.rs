//! Smart-home telemetry ingestion
//!
//! Accepts sensor readings over HTTP and forwards each one as a durable JSON
//! message onto a broker queue for downstream consumers.
//!
//! ```text
//! HTTP ──► TelemetryReading ──► TelemetryEvent ──► Publisher ──► broker queue
//! ```
//!
//! - [`telemetry`] - event model
//! - [`broker`] - connection manager, publisher, retry decorator, transports
//! - [`lifecycle`] - startup/shutdown coordination
//! - [`http`] - ingest endpoints
//! - [`config`] - configuration loading

pub mod broker;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod telemetry;

pub use broker::{BrokerError, ConnectionManager, Publisher, TelemetrySink};
pub use lifecycle::{Lifecycle, LifecycleSettings};
pub use telemetry::TelemetryEvent;
