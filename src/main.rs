use color_eyre::{eyre::eyre, Result};
use smarthome_telemetry::broker::{self, RetryingPublisher, TelemetrySink};
use smarthome_telemetry::config::ServiceConfig;
use smarthome_telemetry::http::{self, ApiState};
use smarthome_telemetry::lifecycle::{shutdown_signal, Lifecycle, LifecycleSettings, Running};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = ServiceConfig::load().await?;
    setup_logging(config.logging.level()?);

    // Broker first: no traffic is accepted without a working publisher
    let connector = broker::connector_for(&config.broker.url)
        .ok_or_else(|| eyre!("Unsupported broker url: {}", config.broker.url))?;
    let running =
        Lifecycle::<Running>::start(LifecycleSettings::from(&config), connector.as_ref())
            .await
            .map_err(|e| eyre!("Unable to connect to broker: {}", e))?;
    info!("Connected to broker successfully");

    let sink: Arc<dyn TelemetrySink> = if config.broker.retry.enabled() {
        info!(
            "Publishing with up to {} attempts",
            config.broker.retry.max_attempts
        );
        Arc::new(RetryingPublisher::new(
            running.publisher(),
            config.broker.retry.policy(),
        ))
    } else {
        Arc::new(running.publisher())
    };
    let app = http::router(ApiState::new(sink, running.tracker()));

    let listener = match TcpListener::bind(&config.http.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            running.begin_shutdown().drain().await;
            return Err(eyre!("Failed to bind {}: {}", config.http.bind, e));
        }
    };
    info!("Server starting on {}", config.http.bind);

    let token = running.shutdown_token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await;
        // A server that stops on its own takes the process down with it
        token.cancel();
        result
    });

    let draining = running.run_until_shutdown(shutdown_signal()).await;
    info!("Shutting down server...");

    let grace = config.http.shutdown_grace();
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => info!("Server exited properly"),
        Ok(Ok(Err(e))) => error!("Server failed: {}", e),
        Ok(Err(e)) => error!("Server task panicked: {}", e),
        Err(_) => warn!("Server forced to shutdown after {:?}", grace),
    }

    draining.drain().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
