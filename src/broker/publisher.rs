//! Telemetry publisher
//!
//! Serializes one [`TelemetryEvent`] and hands it to the pre-declared queue
//! with a hard deadline. No internal retry: a failed publish is reported and
//! the event is not kept anywhere. Callers wanting retries wrap the publisher
//! in a [`RetryingPublisher`](super::retry::RetryingPublisher).

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::error::{BrokerError, PublishFailure, TransportError};
use super::transport::{MessageProperties, OutboundMessage};
use crate::telemetry::TelemetryEvent;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that accepts telemetry events for delivery.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Publishes `event`, giving up early when `cancel` fires.
    async fn publish_with_cancel(
        &self,
        event: TelemetryEvent,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;

    async fn publish(&self, event: TelemetryEvent) -> Result<(), BrokerError> {
        self.publish_with_cancel(event, &CancellationToken::new())
            .await
    }
}

/// Cheap to clone; every clone shares the same connection manager.
#[derive(Debug, Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Canonical JSON encoding of an event, as consumers decode it.
    pub fn encode(event: &TelemetryEvent) -> Result<Vec<u8>, BrokerError> {
        event.validate()?;
        Ok(serde_json::to_vec(event)?)
    }

    async fn deliver(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let session = self.manager.session().await;
        let Some(session) = session.as_ref() else {
            return Err(BrokerError::Publish(PublishFailure::ChannelUnavailable));
        };
        if !session.connection.is_connected() {
            return Err(BrokerError::Channel(TransportError::Closed("connection")));
        }
        if !session.channel.is_open() {
            return Err(BrokerError::Channel(TransportError::Closed("channel")));
        }
        session
            .channel
            .publish(message)
            .await
            .map_err(|e| BrokerError::Publish(PublishFailure::Transport(e)))
    }
}

#[async_trait]
impl TelemetrySink for Publisher {
    async fn publish_with_cancel(
        &self,
        event: TelemetryEvent,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let payload = Self::encode(&event).inspect_err(|e| {
            warn!("Rejected telemetry from {}: {}", event.device_id(), e);
        })?;
        let message = OutboundMessage {
            routing_key: self.manager.queue().to_string(),
            payload,
            properties: MessageProperties::persistent_json(Utc::now()),
        };
        debug!(
            "Publishing {} bytes to {}",
            message.payload.len(),
            message.routing_key
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Publish(PublishFailure::Cancelled)),
            delivered = tokio::time::timeout(self.timeout, self.deliver(message)) => {
                match delivered {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Publish(PublishFailure::TimedOut(self.timeout))),
                }
            }
        };

        match &outcome {
            Ok(()) => info!("Published telemetry: {}", event),
            Err(e) => warn!("Failed to publish telemetry {}: {}", event, e),
        }
        outcome
    }
}
