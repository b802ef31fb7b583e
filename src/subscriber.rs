//! Subscriber engine — poll, dispatch, commit, dead-letter
//!
//! One engine runs per registered subscription on its own task:
//!
//! ```text
//! Unregistered -> Polling -> Dispatching -> [RoutingToDlq] -> Committing -> Polling
//!                    |                                                        |
//!                    +--------------------- cancelled ---------------------> Stopped
//! ```
//!
//! With `commit_before_processing` the `Committing` step runs right after the
//! poll, before `Dispatching`. Offsets are either buffered and flushed every
//! auto-commit interval, or committed synchronously per message when
//! auto-commit is disabled.

use crate::dlq::{DeadLetter, DeadLetterRouter};
use crate::error::{EventError, Result};
use crate::metrics::{MetricsSink, ProcessOutcome};
use crate::provider::{CommitMode, Consumer, TopicPartitionOffset};
use crate::subscribe::Handler;
use crate::types::{ConsumedMessage, Event};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

/// Upper bound on one consumer poll; also bounds how late a stop is noticed
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a failed poll before trying again
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unregistered,
    Polling,
    Dispatching,
    Committing,
    RoutingToDlq,
    Stopped,
}

/// When and how consumed offsets are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    /// Commit before the callback runs (at-most-once)
    pub before_processing: bool,
    /// Flush interval for buffered offsets; `None` commits every message
    pub auto_commit_interval: Option<Duration>,
    /// Don't wait for buffered-offset flushes
    pub async_flush: bool,
}

/// Latest commit position per partition, waiting for the next flush
#[derive(Debug, Default)]
struct OffsetBuffer {
    pending: HashMap<(String, i32), i64>,
}

impl OffsetBuffer {
    fn store(&mut self, tpo: TopicPartitionOffset) {
        let slot = self.pending.entry((tpo.topic, tpo.partition)).or_insert(tpo.offset);
        if tpo.offset > *slot {
            *slot = tpo.offset;
        }
    }

    fn drain(&mut self) -> Vec<TopicPartitionOffset> {
        self.pending
            .drain()
            .map(|((topic, partition), offset)| TopicPartitionOffset {
                topic,
                partition,
                offset,
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Slugs with a live subscription on one client
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    slugs: Mutex<HashSet<String>>,
}

impl Registrations {
    /// Reserve `slug`; the reservation ends when the guard drops
    pub(crate) fn claim(self: &Arc<Self>, slug: &str) -> Result<RegistrationGuard> {
        let mut slugs = self.slugs.lock().unwrap_or_else(|e| e.into_inner());
        if !slugs.insert(slug.to_string()) {
            return Err(EventError::AlreadyRegistered(slug.to_string()));
        }
        Ok(RegistrationGuard {
            registrations: self.clone(),
            slug: slug.to_string(),
        })
    }

    pub(crate) fn contains(&self, slug: &str) -> bool {
        self.slugs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(slug)
    }
}

pub(crate) struct RegistrationGuard {
    registrations: Arc<Registrations>,
    slug: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registrations
            .slugs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.slug);
        tracing::debug!(slug = %self.slug, "Subscription slug released");
    }
}

/// Handle to a running subscription
///
/// Dropping the handle does not stop the subscription; cancel the token
/// passed to `register` or call `stop`.
pub struct SubscriptionHandle {
    slug: String,
    cancel: CancellationToken,
    state: Option<watch::Receiver<SubscriptionState>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("slug", &self.slug)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionHandle {
    pub(crate) fn spawned(
        slug: String,
        cancel: CancellationToken,
        state: watch::Receiver<SubscriptionState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            slug,
            cancel,
            state: Some(state),
            task: Some(task),
        }
    }

    /// Handle for a backend with no polling task; stopped once cancelled
    pub(crate) fn idle(slug: String, cancel: CancellationToken) -> Self {
        Self {
            slug,
            cancel,
            state: None,
            task: None,
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn state(&self) -> SubscriptionState {
        match &self.state {
            Some(state) => *state.borrow(),
            None if self.cancel.is_cancelled() => SubscriptionState::Stopped,
            None => SubscriptionState::Polling,
        }
    }

    /// Request a graceful stop: buffered offsets are flushed and the
    /// consumer leaves its group
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Kill the polling task without flushing or closing anything
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Wait until the subscription has stopped
    pub async fn join(mut self) {
        match self.task.take() {
            Some(task) => {
                let _ = task.await;
            }
            None => self.cancel.cancelled().await,
        }
    }
}

/// Only the field needed for event-name filtering on raw subscriptions
#[derive(Deserialize)]
struct NameOnly {
    #[serde(default)]
    name: String,
}

enum Step {
    Stop,
    Flush,
    Polled(Result<Option<ConsumedMessage>>),
}

enum Dispatch {
    Handled,
    Filtered,
    Failed(String),
}

pub(crate) struct SubscriptionEngine {
    slug: String,
    event_name: String,
    handler: Handler,
    consumer: Box<dyn Consumer>,
    policy: CommitPolicy,
    buffer: OffsetBuffer,
    dlq: Option<DeadLetterRouter>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
    _registration: RegistrationGuard,
}

impl SubscriptionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slug: String,
        event_name: String,
        handler: Handler,
        consumer: Box<dyn Consumer>,
        policy: CommitPolicy,
        dlq: Option<DeadLetterRouter>,
        metrics: Arc<dyn MetricsSink>,
        cancel: CancellationToken,
        registration: RegistrationGuard,
    ) -> (Self, watch::Receiver<SubscriptionState>) {
        let (state, rx) = watch::channel(SubscriptionState::Unregistered);
        let engine = Self {
            slug,
            event_name,
            handler,
            consumer,
            policy,
            buffer: OffsetBuffer::default(),
            dlq,
            metrics,
            cancel,
            state,
            _registration: registration,
        };
        (engine, rx)
    }

    fn transition(&self, to: SubscriptionState) {
        let from = *self.state.borrow();
        if from != to {
            tracing::trace!(slug = %self.slug, ?from, ?to, "Subscription state change");
            self.state.send_replace(to);
        }
    }

    /// Poll until cancelled, then flush and leave the group
    pub(crate) async fn run(mut self) {
        tracing::info!(slug = %self.slug, "Subscription started");
        self.transition(SubscriptionState::Polling);

        let mut flush = self.policy.auto_commit_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                _ = next_tick(&mut flush) => Step::Flush,
                polled = self.consumer.poll(POLL_TIMEOUT) => Step::Polled(polled),
            };

            match step {
                Step::Stop => break,
                Step::Flush => {
                    let mode = if self.policy.async_flush {
                        CommitMode::Async
                    } else {
                        CommitMode::Sync
                    };
                    self.flush(mode).await;
                }
                Step::Polled(Ok(Some(msg))) => self.handle(msg).await,
                Step::Polled(Ok(None)) => {}
                Step::Polled(Err(e)) => {
                    tracing::warn!(slug = %self.slug, error = %e, "Poll failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, msg: ConsumedMessage) {
        let started = Instant::now();

        if self.policy.before_processing {
            self.transition(SubscriptionState::Committing);
            self.commit(&msg).await;
        }

        self.transition(SubscriptionState::Dispatching);
        let outcome = match self.dispatch(&msg).await {
            Dispatch::Handled => ProcessOutcome::Success,
            Dispatch::Filtered => ProcessOutcome::Filtered,
            Dispatch::Failed(reason) => {
                tracing::error!(
                    slug = %self.slug,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %reason,
                    "Message processing failed"
                );
                if let Some(dlq) = &self.dlq {
                    self.transition(SubscriptionState::RoutingToDlq);
                    let _ = dlq
                        .route(DeadLetter::new(msg.clone(), reason))
                        .await;
                }
                ProcessOutcome::Failure
            }
        };
        self.metrics
            .message_processed(&self.slug, started.elapsed(), outcome);

        if !self.policy.before_processing {
            self.transition(SubscriptionState::Committing);
            self.commit(&msg).await;
        }

        self.transition(SubscriptionState::Polling);
    }

    async fn dispatch(&self, msg: &ConsumedMessage) -> Dispatch {
        let ctx = self.cancel.child_token();
        let callback = match &self.handler {
            Handler::Decoded(callback) => {
                let decoded = serde_json::from_slice::<Event>(&msg.value)
                    .map(|mut event| {
                        event.annotate(msg);
                        event
                    })
                    .map_err(EventError::from);
                if let Ok(event) = &decoded {
                    if !self.matches(&event.event_name) {
                        return Dispatch::Filtered;
                    }
                }
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(ctx, decoded)))
            }
            Handler::Raw(callback) => {
                if !self.event_name.is_empty() {
                    if let Ok(header) = serde_json::from_slice::<NameOnly>(&msg.value) {
                        if !self.matches(&header.name) {
                            return Dispatch::Filtered;
                        }
                    }
                }
                let value = msg.value.clone();
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(ctx, value)))
            }
        };

        // The closure itself may panic before handing back its future
        let callback = match callback {
            Ok(future) => future,
            Err(panic) => {
                return Dispatch::Failed(format!("callback panicked: {}", panic_message(&*panic)))
            }
        };

        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(e)) => Dispatch::Failed(e.to_string()),
            Err(panic) => Dispatch::Failed(format!("callback panicked: {}", panic_message(&*panic))),
        }
    }

    fn matches(&self, event_name: &str) -> bool {
        self.event_name.is_empty() || self.event_name == event_name
    }

    async fn commit(&mut self, msg: &ConsumedMessage) {
        let position = TopicPartitionOffset::after(msg);
        if self.policy.auto_commit_interval.is_some() {
            self.buffer.store(position);
            return;
        }
        if let Err(e) = self.consumer.commit(&[position], CommitMode::Sync).await {
            tracing::error!(
                slug = %self.slug,
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "Offset commit failed"
            );
            self.metrics.commit_failed(&self.slug);
        }
    }

    async fn flush(&mut self, mode: CommitMode) {
        if self.buffer.is_empty() {
            return;
        }
        let offsets = self.buffer.drain();
        if let Err(e) = self.consumer.commit(&offsets, mode).await {
            tracing::error!(slug = %self.slug, error = %e, "Offset flush failed");
            self.metrics.commit_failed(&self.slug);
        }
    }

    async fn shutdown(mut self) {
        self.flush(CommitMode::Sync).await;
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(slug = %self.slug, error = %e, "Consumer close failed");
        }
        self.transition(SubscriptionState::Stopped);
        tracing::info!(slug = %self.slug, "Subscription stopped");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
