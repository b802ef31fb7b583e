//! Publisher engine — timeout, retry and delivery reporting
//!
//! `publish_sync` waits for the broker acknowledgement, bounded by the
//! publish timeout and the caller's cancellation token. `publish` hands
//! delivery to a background task; failures are queued to a dedicated
//! reporter task that invokes the builder's error callback.

use crate::error::{EventError, Result};
use crate::metrics::MetricsSink;
use crate::provider::Transport;
use crate::publish::PublishErrorCallback;
use crate::types::{DeliveryReport, Message};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Capacity of the publish-failure queue; the oldest entries are dropped when full
pub const ERROR_QUEUE_CAPACITY: usize = 1024;

/// Backoff between attempts after a retriable transport error
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay` (attempt is 0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A fire-and-forget publish that could not be delivered
#[derive(Clone)]
pub struct PublishFailure {
    /// Serialized message value
    pub message: Bytes,
    pub error: Arc<EventError>,
    callback: Option<PublishErrorCallback>,
}

/// Bounded queue between delivery tasks and the error callbacks
///
/// The reporter task starts with the first failure.
#[derive(Default)]
pub(crate) struct ErrorReporter {
    tx: OnceLock<broadcast::Sender<PublishFailure>>,
}

impl ErrorReporter {
    fn sender(&self) -> &broadcast::Sender<PublishFailure> {
        self.tx.get_or_init(|| {
            let (tx, rx) = broadcast::channel(ERROR_QUEUE_CAPACITY);
            tokio::spawn(run_reporter(rx));
            tx
        })
    }

    pub(crate) fn report(&self, failure: PublishFailure) {
        if failure.callback.is_none() {
            tracing::error!(error = %failure.error, "Publish failed, no error callback registered");
            return;
        }
        if self.sender().send(failure).is_err() {
            tracing::error!("Publish error reporter is not running, failure dropped");
        }
    }
}

async fn run_reporter(rx: broadcast::Receiver<PublishFailure>) {
    let mut stream = BroadcastStream::new(rx);
    while let Some(item) = stream.next().await {
        match item {
            Ok(failure) => {
                let Some(callback) = failure.callback else {
                    continue;
                };
                let message = failure.message;
                let error = failure.error;
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(message, error)
                }));
                if outcome.is_err() {
                    tracing::error!("Publish error callback panicked");
                }
            }
            Err(BroadcastStreamRecvError::Lagged(dropped)) => {
                tracing::warn!(dropped, "Publish error queue full, oldest failures dropped");
            }
        }
    }
    tracing::debug!("Publish error reporter stopped");
}

/// Delivery engine shared by every publish on one client
pub struct Publisher {
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    publish_timeout: Duration,
    retry: RetryPolicy,
    /// Set until the first publish claims the per-builder timeout
    first_publish: AtomicBool,
    reporter: ErrorReporter,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            metrics,
            publish_timeout,
            retry: RetryPolicy::default(),
            first_publish: AtomicBool::new(true),
            reporter: ErrorReporter::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Timeout for the next publish
    ///
    /// A builder timeout is honoured only by the first publish through this
    /// publisher; every later call uses the configured publish timeout.
    pub fn resolve_timeout(&self, builder_timeout: Option<Duration>) -> Duration {
        let first = self.first_publish.swap(false, Ordering::AcqRel);
        match builder_timeout {
            Some(timeout) if first => timeout,
            _ => self.publish_timeout,
        }
    }

    /// Send and wait for the acknowledgement, retrying transient errors
    /// until `timeout` elapses
    pub async fn deliver(&self, message: Message, timeout: Duration) -> Result<DeliveryReport> {
        let topic = message.topic.clone();
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, self.attempt_until_done(message)).await {
            Ok(result) => result,
            Err(_) => Err(EventError::PublishTimeout {
                topic: topic.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        self.metrics
            .message_published(&topic, started.elapsed(), result.is_ok());

        match &result {
            Ok(report) => tracing::debug!(
                topic = %topic,
                partition = report.partition,
                offset = report.offset,
                "Message delivered"
            ),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "Message delivery failed"),
        }

        result
    }

    async fn attempt_until_done(&self, message: Message) -> Result<DeliveryReport> {
        let mut attempt = 0u32;
        loop {
            let result = match self.transport.send(message.clone()).await {
                Ok(ack) => ack.await,
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_retriable() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        topic = %message.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying publish"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Block until acknowledged, timed out or cancelled
    pub async fn publish_sync(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EventError::Cancelled),
            result = self.deliver(message, timeout) => result,
        }
    }

    /// Deliver in the background; failures go to `callback` via the reporter
    pub fn publish(
        self: &Arc<Self>,
        message: Message,
        timeout: Duration,
        callback: Option<PublishErrorCallback>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let value = message.value.clone();
            if let Err(e) = this.deliver(message, timeout).await {
                this.reporter.report(PublishFailure {
                    message: value,
                    error: Arc::new(e),
                    callback,
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::provider::memory::{AckBehavior, MemoryBroker};
    use std::sync::Mutex;

    fn publisher(broker: &MemoryBroker, timeout: Duration) -> Arc<Publisher> {
        Arc::new(
            Publisher::new(Arc::new(broker.clone()), Arc::new(NoopMetrics), timeout).with_retry(
                RetryPolicy {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            ),
        )
    }

    fn message(topic: &str) -> Message {
        Message {
            topic: topic.to_string(),
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"{\"name\":\"created\"}"),
        }
    }

    #[test]
    fn test_retry_delay_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_timeout_only_for_first_publish() {
        let broker = MemoryBroker::new();
        let p = publisher(&broker, Duration::from_secs(60));
        assert_eq!(p.resolve_timeout(Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(p.resolve_timeout(Some(Duration::from_secs(2))), Duration::from_secs(60));
        assert_eq!(p.resolve_timeout(None), Duration::from_secs(60));
    }

    #[test]
    fn test_first_publish_without_override_consumes_slot() {
        let broker = MemoryBroker::new();
        let p = publisher(&broker, Duration::from_secs(60));
        assert_eq!(p.resolve_timeout(None), Duration::from_secs(60));
        assert_eq!(p.resolve_timeout(Some(Duration::from_secs(2))), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_publish_sync_acknowledged() {
        let broker = MemoryBroker::new();
        let p = publisher(&broker, Duration::from_secs(1));
        let report = p
            .publish_sync(message("orders"), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.offset, 0);
        assert_eq!(broker.messages("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_sync_times_out_without_ack() {
        let broker = MemoryBroker::new();
        broker.set_ack_behavior(AckBehavior::Never);
        let p = publisher(&broker, Duration::from_millis(50));
        let err = p
            .publish_sync(message("orders"), Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::PublishTimeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_publish_sync_permanent_failure() {
        let broker = MemoryBroker::new();
        broker.set_ack_behavior(AckBehavior::Reject("message too large".into()));
        let p = publisher(&broker, Duration::from_secs(1));
        let err = p
            .publish_sync(message("orders"), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Transport { retriable: false, .. }));
    }

    #[tokio::test]
    async fn test_publish_sync_retries_transient_errors() {
        let broker = MemoryBroker::new();
        broker.fail_next_sends(3);
        let p = publisher(&broker, Duration::from_secs(1));
        let report = p
            .publish_sync(message("orders"), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(report.is_ok());
        assert_eq!(broker.messages("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_sync_cancelled() {
        let broker = MemoryBroker::new();
        broker.set_ack_behavior(AckBehavior::Never);
        let p = publisher(&broker, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = p
            .publish_sync(message("orders"), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Cancelled));
    }

    #[tokio::test]
    async fn test_fire_and_forget_failure_reaches_callback() {
        let broker = MemoryBroker::new();
        broker.set_ack_behavior(AckBehavior::Reject("unknown topic".into()));
        let p = publisher(&broker, Duration::from_secs(1));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: PublishErrorCallback = Arc::new(move |message, error| {
            seen_cb.lock().unwrap().push(message);
            let _ = tx.send(error.to_string());
        });

        p.publish(message("orders"), Duration::from_secs(1), Some(callback));

        let error = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(error.contains("unknown topic"));
        assert_eq!(&seen.lock().unwrap()[0][..], b"{\"name\":\"created\"}");
    }

    #[tokio::test]
    async fn test_fire_and_forget_success_skips_callback() {
        let broker = MemoryBroker::new();
        let p = publisher(&broker, Duration::from_secs(1));
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let callback: PublishErrorCallback = Arc::new(move |_, _| flag.store(true, Ordering::SeqCst));

        p.publish(message("orders"), Duration::from_secs(1), Some(callback));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.messages("orders").len(), 1);
        assert!(!called.load(Ordering::SeqCst));
    }
}
