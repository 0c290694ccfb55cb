//! AMQP 0-9-1 transport backed by `lapin`
//!
//! Queue declared durable, non-exclusive, non-auto-deleting. Messages go to
//! the default exchange with the queue name as routing key, so the broker
//! routes them straight to the queue without fan-out.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::error::TransportError;
use super::transport::{
    redact_url, BrokerChannel, BrokerConnection, BrokerConnector, OutboundMessage, QueueSpec,
    TransportResult,
};

const REPLY_SUCCESS: u16 = 200;
const DEFAULT_EXCHANGE: &str = "";

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidChannelState(_) => TransportError::Closed("channel"),
            lapin::Error::InvalidConnectionState(_) => TransportError::Closed("connection"),
            lapin::Error::IOError(io) => TransportError::Io(io.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// Client properties that run lapin's I/O and callbacks on the current tokio
/// runtime instead of its own executor threads.
pub fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// Dials RabbitMQ (or any AMQP 0-9-1 broker) with `amqp://` / `amqps://` URLs.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn BrokerConnection>> {
        debug!("Dialing AMQP broker at {}", redact_url(url));
        let connection = Connection::connect(url, connection_properties())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Box::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!("Opened AMQP channel {}", channel.id());
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.connection.status().connected() {
            return Err(TransportError::Closed("connection"));
        }
        self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await?;
        debug!(
            "Queue {} declared ({} messages, {} consumers)",
            spec.name,
            queue.message_count(),
            queue.consumer_count()
        );
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.properties.content_type.into())
            .with_delivery_mode(message.properties.delivery_mode)
            .with_timestamp(message.properties.timestamp.timestamp().max(0) as u64);

        // No confirm mode on this channel, so the returned confirmation is
        // not awaited: accepted by the client means handed to the broker.
        let _confirm = self
            .channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.channel.status().connected() {
            return Err(TransportError::Closed("channel"));
        }
        self.channel.close(REPLY_SUCCESS, "shutdown").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
