//! Bounded retry decorator
//!
//! Layered on top of any [`TelemetrySink`] so the publisher itself keeps its
//! single-attempt semantics. Only retryable errors ([`BrokerError::is_retryable`])
//! trigger another attempt. A retried publish can reach the queue twice when
//! the first attempt timed out after the broker already accepted it.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{BrokerError, PublishFailure};
use super::publisher::TelemetrySink;
use crate::telemetry::TelemetryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct RetryingPublisher<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: TelemetrySink> RetryingPublisher<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: TelemetrySink> TelemetrySink for RetryingPublisher<S> {
    async fn publish_with_cancel(
        &self,
        event: TelemetryEvent,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .inner
                .publish_with_cancel(event.clone(), cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Publish attempt {}/{} for {} failed: {}, retrying in {:?}",
                        attempt,
                        max_attempts,
                        event.device_id(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(BrokerError::Publish(PublishFailure::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    debug!("Giving up on {} after {} attempt(s)", event.device_id(), attempt);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::error::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` calls with the given error.
    struct FlakySink {
        failures: u32,
        error: BrokerError,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TelemetrySink for FlakySink {
        async fn publish_with_cancel(
            &self,
            _event: TelemetryEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), BrokerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn flaky(failures: u32, error: BrokerError) -> (FlakySink, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            FlakySink {
                failures,
                error,
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn timed_out() -> BrokerError {
        BrokerError::Publish(PublishFailure::TimedOut(Duration::from_secs(5)))
    }

    fn event() -> TelemetryEvent {
        TelemetryEvent::now("sensor-1", "temperature", 20.0, "C")
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_transient_publish_failures() {
        let (sink, calls) = flaky(2, timed_out());
        let publisher = RetryingPublisher::new(sink, fast_policy(3));

        publisher.publish(event()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let (sink, calls) = flaky(10, timed_out());
        let publisher = RetryingPublisher::new(sink, fast_policy(3));

        assert_eq!(publisher.publish(event()).await.unwrap_err(), timed_out());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_serialization_or_channel_errors() {
        for error in [
            BrokerError::Serialization("value is NaN".into()),
            BrokerError::Channel(TransportError::Closed("channel")),
        ] {
            let (sink, calls) = flaky(10, error.clone());
            let publisher = RetryingPublisher::new(sink, fast_policy(5));
            assert_eq!(publisher.publish(event()).await.unwrap_err(), error);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let (sink, calls) = flaky(10, timed_out());
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        };
        let publisher = RetryingPublisher::new(sink, policy);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = publisher
            .publish_with_cancel(event(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Publish(PublishFailure::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
