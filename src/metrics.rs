//! Subscription identity and the observability sink
//!
//! Every subscription is labelled by its slug, `<topic>.<eventName>.<groupID>`.
//! The sink is injected through `BrokerConfig::metrics`; without one,
//! `NoopMetrics` is used.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Separator between slug components
pub const SLUG_SEPARATOR: &str = ".";

/// Build the identifying slug for a subscription
pub fn slug(topic: &str, event_name: &str, group_id: &str) -> String {
    format!(
        "{}{}{}{}{}",
        topic, SLUG_SEPARATOR, event_name, SLUG_SEPARATOR, group_id
    )
}

/// How a consumed message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    Failure,
    /// Dropped by the event-name filter
    Filtered,
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Success => "success",
            ProcessOutcome::Failure => "failure",
            ProcessOutcome::Filtered => "filtered",
        }
    }
}

/// Counter / histogram style sink for client activity
pub trait MetricsSink: Send + Sync {
    /// A message was published (or failed to be) on `topic`
    fn message_published(&self, topic: &str, elapsed: Duration, success: bool);

    /// A subscription finished handling one message
    fn message_processed(&self, slug: &str, elapsed: Duration, outcome: ProcessOutcome);

    /// A failed message was forwarded to its dead-letter topic
    fn message_dead_lettered(&self, slug: &str, success: bool);

    /// An offset commit failed
    fn commit_failed(&self, slug: &str);
}

/// Sink that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn message_published(&self, _topic: &str, _elapsed: Duration, _success: bool) {}
    fn message_processed(&self, _slug: &str, _elapsed: Duration, _outcome: ProcessOutcome) {}
    fn message_dead_lettered(&self, _slug: &str, _success: bool) {}
    fn commit_failed(&self, _slug: &str) {}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PublishLabels {
    topic: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SubscriptionLabels {
    slug: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SlugLabels {
    slug: String,
}

fn latency_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

fn status(success: bool) -> String {
    if success { "success" } else { "failure" }.to_string()
}

/// Prometheus-backed sink
pub struct PrometheusMetrics {
    published: Family<PublishLabels, Counter>,
    publish_latency: Family<PublishLabels, Histogram>,
    processed: Family<SubscriptionLabels, Counter>,
    process_latency: Family<SubscriptionLabels, Histogram>,
    dead_lettered: Family<SubscriptionLabels, Counter>,
    commit_failures: Family<SlugLabels, Counter>,
}

impl PrometheusMetrics {
    /// Create the metric families and register them under `eventstream_`
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            published: Family::default(),
            publish_latency: Family::new_with_constructor(latency_histogram),
            processed: Family::default(),
            process_latency: Family::new_with_constructor(latency_histogram),
            dead_lettered: Family::default(),
            commit_failures: Family::default(),
        };

        let sub = registry.sub_registry_with_prefix("eventstream");
        sub.register(
            "published_messages",
            "Messages published per topic and status",
            metrics.published.clone(),
        );
        sub.register(
            "publish_duration_seconds",
            "Time until a publish was acknowledged or failed",
            metrics.publish_latency.clone(),
        );
        sub.register(
            "processed_messages",
            "Messages handled per subscription and outcome",
            metrics.processed.clone(),
        );
        sub.register(
            "process_duration_seconds",
            "Callback processing time per subscription",
            metrics.process_latency.clone(),
        );
        sub.register(
            "dead_lettered_messages",
            "Messages forwarded to a dead-letter topic",
            metrics.dead_lettered.clone(),
        );
        sub.register(
            "commit_failures",
            "Offset commits that failed",
            metrics.commit_failures.clone(),
        );

        metrics
    }
}

impl MetricsSink for PrometheusMetrics {
    fn message_published(&self, topic: &str, elapsed: Duration, success: bool) {
        let labels = PublishLabels {
            topic: topic.to_string(),
            status: status(success),
        };
        self.published.get_or_create(&labels).inc();
        self.publish_latency
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }

    fn message_processed(&self, slug: &str, elapsed: Duration, outcome: ProcessOutcome) {
        let labels = SubscriptionLabels {
            slug: slug.to_string(),
            status: outcome.as_str().to_string(),
        };
        self.processed.get_or_create(&labels).inc();
        self.process_latency
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }

    fn message_dead_lettered(&self, slug: &str, success: bool) {
        let labels = SubscriptionLabels {
            slug: slug.to_string(),
            status: status(success),
        };
        self.dead_lettered.get_or_create(&labels).inc();
    }

    fn commit_failed(&self, slug: &str) {
        self.commit_failures
            .get_or_create(&SlugLabels {
                slug: slug.to_string(),
            })
            .inc();
    }
}
