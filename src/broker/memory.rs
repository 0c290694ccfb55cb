//! In-process broker
//!
//! Implements the broker seam entirely in memory. Used by the test suite and
//! by local runs configured with a `memory://` broker URL. Behaves like the
//! default exchange of an AMQP broker: messages routed to an undeclared queue
//! are dropped, and redeclaring a queue with different parameters is refused.
//!
//! Failure knobs let tests drive every error path of the connection manager
//! and publisher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::error::TransportError;
use super::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, OutboundMessage, QueueSpec, TransportResult,
};

#[derive(Debug, Default)]
struct MemoryQueue {
    spec: Option<QueueSpec>,
    messages: Vec<OutboundMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    refuse_connections: bool,
    fail_channel_open: bool,
    fail_queue_declare: bool,
    publish_delay: Option<Duration>,
    connections: Vec<Arc<AtomicBool>>,
    channels: Vec<Arc<AtomicBool>>,
}

/// Shared handle to one in-memory broker. Clones see the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dials fail as if the broker were down.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    pub fn fail_channel_open(&self, fail: bool) {
        self.state().fail_channel_open = fail;
    }

    pub fn fail_queue_declare(&self, fail: bool) {
        self.state().fail_queue_declare = fail;
    }

    /// Makes every publish wait before it is accepted, simulating a broker
    /// that stopped reading from the socket.
    pub fn stall_publishes(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    /// Closes every open channel from the broker side.
    pub fn close_channels_remotely(&self) {
        for channel in &self.state().channels {
            channel.store(false, Ordering::SeqCst);
        }
    }

    pub fn messages(&self, queue: &str) -> Vec<OutboundMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state().queues.get(queue).and_then(|q| q.spec.clone())
    }

    pub fn open_connections(&self) -> usize {
        count_open(&self.state().connections)
    }

    pub fn open_channels(&self) -> usize {
        count_open(&self.state().channels)
    }
}

fn count_open(flags: &[Arc<AtomicBool>]) -> usize {
    flags.iter().filter(|f| f.load(Ordering::SeqCst)).count()
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _url: &str) -> TransportResult<Box<dyn BrokerConnection>> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(open.clone());
        debug!("Memory broker accepted connection #{}", state.connections.len());
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            open,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(TransportError::Closed("connection"));
        }
        let mut state = self.broker.state();
        if state.fail_channel_open {
            return Err(TransportError::Protocol("CHANNEL_ERROR - channel limit reached".into()));
        }
        let open = Arc::new(AtomicBool::new(true));
        state.channels.push(open.clone());
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.open.clone(),
            open,
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// A dropped handle no longer counts as open
impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> TransportResult<()> {
        if !self.connection.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("channel"));
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if state.fail_queue_declare {
            return Err(TransportError::Protocol(format!(
                "ACCESS_REFUSED - access to queue '{}' refused",
                spec.name
            )));
        }
        let queue = state.queues.entry(spec.name.clone()).or_default();
        if let Some(existing) = &queue.spec {
            if existing != spec {
                // Broker closes the channel on PRECONDITION_FAILED
                self.open.store(false, Ordering::SeqCst);
                return Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    spec.name
                )));
            }
            return Ok(());
        }
        queue.spec = Some(spec.clone());
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        self.ensure_open()?;
        let delay = self.broker.state().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_open()?;
        }
        let mut state = self.broker.state();
        match state.queues.get_mut(&message.routing_key) {
            Some(queue) if queue.spec.is_some() => queue.messages.push(message),
            _ => debug!("Dropping unroutable message for {}", message.routing_key),
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Closed("channel"));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MessageProperties;
    use chrono::Utc;

    fn message(queue: &str, body: &str) -> OutboundMessage {
        OutboundMessage {
            routing_key: queue.to_string(),
            payload: body.as_bytes().to_vec(),
            properties: MessageProperties::persistent_json(Utc::now()),
        }
    }

    #[tokio::test]
    async fn routes_to_declared_queue_only() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueSpec::durable("telemetry_events"))
            .await
            .unwrap();

        channel.publish(message("telemetry_events", "{}")).await.unwrap();
        channel.publish(message("nowhere", "{}")).await.unwrap();

        assert_eq!(broker.messages("telemetry_events").len(), 1);
        assert!(broker.messages("nowhere").is_empty());
    }

    #[tokio::test]
    async fn identical_redeclaration_is_a_noop() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let spec = QueueSpec::durable("telemetry_events");
        channel.declare_queue(&spec).await.unwrap();
        channel.publish(message("telemetry_events", "{}")).await.unwrap();
        channel.declare_queue(&spec).await.unwrap();

        assert_eq!(broker.messages("telemetry_events").len(), 1);
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn inequivalent_redeclaration_closes_channel() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueSpec::durable("telemetry_events"))
            .await
            .unwrap();

        let mut transient = QueueSpec::durable("telemetry_events");
        transient.durable = false;
        let err = channel.declare_queue(&transient).await.unwrap_err();

        assert!(matches!(err, TransportError::Protocol(_)));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn counts_open_resources() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        assert_eq!((broker.open_connections(), broker.open_channels()), (1, 1));

        channel.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!((broker.open_connections(), broker.open_channels()), (0, 0));

        assert_eq!(conn.close().await, Err(TransportError::Closed("connection")));
    }

    #[tokio::test]
    async fn dropped_handles_are_not_counted_as_open() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        drop(channel);
        assert_eq!((broker.open_connections(), broker.open_channels()), (1, 0));
        drop(conn);
        assert_eq!((broker.open_connections(), broker.open_channels()), (0, 0));
    }

    #[tokio::test]
    async fn closed_connection_invalidates_its_channels() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        conn.close().await.unwrap();

        assert!(!channel.is_open());
        assert_eq!(
            channel.publish(message("telemetry_events", "{}")).await,
            Err(TransportError::Closed("connection"))
        );
    }
}
