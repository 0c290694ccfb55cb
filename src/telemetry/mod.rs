//! Telemetry event model
//!
//! The wire representation of a single sensor measurement. Events are built by
//! the inbound collaborator (see [`crate::http`]) and handed by value to the
//! [`Publisher`](crate::broker::Publisher).

pub mod event;

pub use event::{EventError, TelemetryEvent, TelemetryReading};
