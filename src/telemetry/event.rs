use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One sensor measurement at a point in time.
///
/// Immutable once constructed: fields are only readable through accessors and
/// the publisher takes the event by value without handing it back.
///
/// Serialized as a flat JSON object:
///
/// ```json
/// {"device_id":"sensor-1","metric_name":"temperature","value":21.5,"unit":"C","timestamp":"2024-05-01T12:00:00Z"}
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    device_id: String,
    metric_name: String,
    value: f64,
    unit: String,
    timestamp: DateTime<Utc>,
}

/// Reasons an event cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    #[error("device_id must not be empty")]
    EmptyDeviceId,

    #[error("metric_name must not be empty")]
    EmptyMetricName,

    /// JSON has no encoding for NaN or infinities
    #[error("value for {metric} is not a finite number: {value}")]
    NonFiniteValue { metric: String, value: f64 },
}

impl TelemetryEvent {
    pub fn new(
        device_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            metric_name: metric_name.into(),
            value,
            unit: unit.into(),
            timestamp,
        }
    }

    /// Builds an event stamped with the current UTC time.
    pub fn now(
        device_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self::new(device_id, metric_name, value, unit, Utc::now())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Checks the event can be encoded and is meaningful to consumers.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.device_id.is_empty() {
            return Err(EventError::EmptyDeviceId);
        }
        if self.metric_name.is_empty() {
            return Err(EventError::EmptyMetricName);
        }
        if !self.value.is_finite() {
            return Err(EventError::NonFiniteValue {
                metric: self.metric_name.clone(),
                value: self.value,
            });
        }
        Ok(())
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} = {:.2} {}",
            self.device_id, self.metric_name, self.value, self.unit
        )
    }
}

/// Inbound shape of a reading, as sent by devices.
///
/// The timestamp is optional; readings without one are stamped on arrival.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TelemetryReading {
    pub device_id: String,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TelemetryReading {
    pub fn into_event(self, now: DateTime<Utc>) -> TelemetryEvent {
        TelemetryEvent::new(
            self.device_id,
            self.metric_name,
            self.value,
            self.unit,
            self.timestamp.unwrap_or(now),
        )
    }
}
