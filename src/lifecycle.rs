//! Lifecycle coordinator with statum state machine
//!
//! Ties the connection manager to the hosting process.
//!
//! # State Machine
//!
//! ```text
//! start() ──► Running ──► Draining ──► Stopped
//!    │          (shutdown signal)  (grace period, close)
//!    └─► Err(BrokerError)  fatal, nothing to tear down
//! ```
//!
//! `Running` is only reachable through a successful open, so no caller can
//! publish before the broker connection exists. `Draining::drain` consumes the
//! machine, which makes the close happen exactly once.

use statum::{machine, state};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::{BrokerConnector, BrokerError, ConnectionManager, Publisher};
use crate::config::ServiceConfig;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub broker_url: String,
    pub queue: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&ServiceConfig> for LifecycleSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            broker_url: config.broker.url.clone(),
            queue: config.broker.queue.clone(),
            connect_timeout: config.broker.connect_timeout(),
            publish_timeout: config.broker.publish_timeout(),
            shutdown_grace: config.http.shutdown_grace(),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LifecycleState {
    Running,  // Broker connected, accepting work
    Draining, // No new work, waiting for in-flight work
    Stopped,  // Broker connection closed
}

#[machine]
pub struct Lifecycle<S: LifecycleState> {
    settings: LifecycleSettings,
    manager: Arc<ConnectionManager>,
    publisher: Publisher,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle<Running> {
    /// Opens the connection manager. Failure is fatal to the host: there is
    /// no degraded mode without a broker.
    pub async fn start(
        settings: LifecycleSettings,
        connector: &dyn BrokerConnector,
    ) -> Result<Self, BrokerError> {
        let manager = ConnectionManager::open_with_timeout(
            connector,
            &settings.broker_url,
            &settings.queue,
            settings.connect_timeout,
        )
        .await?;
        let manager = Arc::new(manager);
        let publisher = Publisher::new(manager.clone()).with_timeout(settings.publish_timeout);

        info!("Telemetry publisher ready on queue {}", settings.queue);
        Ok(Self::new(
            settings,
            manager,
            publisher,
            CancellationToken::new(),
            TaskTracker::new(),
        ))
    }

    /// Publisher handle to inject into request handlers.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Cancelling this token starts the shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// In-flight work tracked here is waited for during draining.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Waits for `signal` or for the shutdown token, then stops taking work.
    pub async fn run_until_shutdown(
        self,
        signal: impl Future<Output = ()>,
    ) -> Lifecycle<Draining> {
        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }
        self.begin_shutdown()
    }

    pub fn begin_shutdown(self) -> Lifecycle<Draining> {
        self.shutdown.cancel();
        self.tracker.close();
        info!("Draining in-flight telemetry");
        self.transition()
    }
}

impl Lifecycle<Draining> {
    /// Gives tracked work up to the grace period, then closes the broker
    /// connection whether or not everything finished.
    pub async fn drain(self) -> Lifecycle<Stopped> {
        let grace = self.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} in-flight task(s) still running after {:?}, closing anyway",
                self.tracker.len(),
                grace
            );
        }
        self.manager.close().await;
        info!("Telemetry publisher stopped");
        self.transition()
    }
}

impl Lifecycle<Stopped> {
    pub fn is_closed(&self) -> bool {
        self.manager.is_closed()
    }
}

/// Resolves on the first termination signal the process receives.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        async fn recv(kind: SignalKind, name: &'static str) -> &'static str {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    name
                }
                Err(e) => {
                    error!("Failed to install {} handler: {}", name, e);
                    std::future::pending().await
                }
            }
        }

        let name = tokio::select! {
            name = recv(SignalKind::interrupt(), "SIGINT") => name,
            name = recv(SignalKind::terminate(), "SIGTERM") => name,
            name = recv(SignalKind::hangup(), "SIGHUP") => name,
            name = recv(SignalKind::quit(), "SIGQUIT") => name,
        };
        info!("Received {}", name);
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
    }
}
