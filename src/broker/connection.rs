//! Connection manager
//!
//! Owns the broker connection and its single channel for the lifetime of the
//! process. The session sits behind an async mutex: publishers take the lock
//! for the duration of one publish, and [`ConnectionManager::close`] takes it
//! to tear the session down, so close waits for an in-flight publish instead
//! of pulling the channel out from under it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::error::{BrokerError, TransportError};
use super::transport::{
    redact_url, BrokerChannel, BrokerConnection, BrokerConnector, QueueSpec, TransportResult,
};

/// Upper bound for each setup step (dial, channel open, queue declare).
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for each teardown step (channel close, connection close).
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// The connection/channel pair held by an open manager.
pub(crate) struct Session {
    pub(crate) connection: Box<dyn BrokerConnection>,
    pub(crate) channel: Box<dyn BrokerChannel>,
}

impl Session {
    /// Channel first, then connection. Each step is bounded, so a broker that
    /// stopped answering cannot hold up shutdown.
    async fn release(self, limit: Duration) {
        close_quietly("channel", bounded(limit, self.channel.close())).await;
        close_quietly("connection", bounded(limit, self.connection.close())).await;
    }
}

pub struct ConnectionManager {
    queue: String,
    url: String,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("queue", &self.queue)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn bounded<T>(
    limit: Duration,
    step: impl Future<Output = TransportResult<T>>,
) -> TransportResult<T> {
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TimedOut(limit)),
    }
}

impl ConnectionManager {
    /// Dials the broker, opens one channel and declares `queue` as durable.
    ///
    /// Every failure path releases whatever was already opened, so a failed
    /// open never leaves a connection or channel behind.
    ///
    /// # Errors
    ///
    /// * [`BrokerError::Connection`] - dial, authentication or dial timeout
    /// * [`BrokerError::Channel`] - connection up, channel could not be opened
    /// * [`BrokerError::QueueDeclaration`] - channel up, declare refused
    pub async fn open(
        connector: &dyn BrokerConnector,
        url: &str,
        queue: &str,
    ) -> Result<Self, BrokerError> {
        Self::open_with_timeout(connector, url, queue, DEFAULT_DIAL_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        connector: &dyn BrokerConnector,
        url: &str,
        queue: &str,
        dial_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let redacted = redact_url(url);
        info!("Connecting to broker at {}", redacted);

        let connection = bounded(dial_timeout, connector.connect(url))
            .await
            .map_err(|source| {
                error!("Failed to connect to broker at {}: {}", redacted, source);
                BrokerError::Connection {
                    url: redacted.clone(),
                    source,
                }
            })?;

        let channel = match bounded(dial_timeout, connection.open_channel()).await {
            Ok(channel) => channel,
            Err(source) => {
                error!("Failed to open channel: {}", source);
                close_quietly("connection", connection.close()).await;
                return Err(BrokerError::Channel(source));
            }
        };

        let spec = QueueSpec::durable(queue);
        if let Err(source) = bounded(dial_timeout, channel.declare_queue(&spec)).await {
            error!("Failed to declare queue {}: {}", queue, source);
            close_quietly("channel", channel.close()).await;
            close_quietly("connection", connection.close()).await;
            return Err(BrokerError::QueueDeclaration {
                queue: queue.to_string(),
                source,
            });
        }

        info!("Connected to broker, queue: {}", queue);
        Ok(Self {
            queue: queue.to_string(),
            url: redacted,
            session: Mutex::new(Some(Session {
                connection,
                channel,
            })),
            closed: AtomicBool::new(false),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        })
    }

    /// Overrides the limit applied to each teardown step.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the channel is still usable from the client's point of view.
    pub async fn is_healthy(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.connection.is_connected() && session.channel.is_open(),
            None => false,
        }
    }

    pub(crate) async fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().await
    }

    /// Closes the channel, then the connection.
    ///
    /// Best effort and idempotent: errors from an already broken connection
    /// are logged, and calls after the first are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Connection manager for {} already closed", self.queue);
            return;
        }
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                session.release(self.close_timeout).await;
                info!("Broker connection to {} closed", self.url);
            }
            None => debug!("No broker session to close"),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        warn!(
            "Connection manager for {} dropped without close, releasing session",
            self.queue
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let limit = self.close_timeout;
                handle.spawn(session.release(limit));
            }
            // Outside a runtime the transports only get their own drop glue
            Err(_) => drop(session),
        }
    }
}

async fn close_quietly(what: &str, step: impl Future<Output = TransportResult<()>>) {
    if let Err(e) = step.await {
        warn!("Ignoring error while closing {}: {}", what, e);
    }
}
