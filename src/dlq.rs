//! Dead Letter Queue — republish messages whose callback failed
//!
//! A failed message is forwarded unchanged (same key, same value) to
//! `<topic>-dlq`. The source offset advances whether or not the forward
//! succeeds; a failed forward is logged and counted.

use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::publisher::Publisher;
use crate::types::{ConsumedMessage, DeliveryReport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Suffix appended to a topic to form its dead-letter topic
pub const DLQ_SUFFIX: &str = "-dlq";

/// Dead-letter topic for `topic`
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{}", topic, DLQ_SUFFIX)
}

/// A failed message with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as consumed from the source topic
    pub message: ConsumedMessage,

    /// Reason the callback failed
    pub reason: String,

    /// Unix timestamp in milliseconds when the message was dead-lettered
    pub dead_lettered_at: i64,
}

impl DeadLetter {
    pub fn new(message: ConsumedMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Topic this letter is forwarded to
    pub fn topic(&self) -> String {
        dead_letter_topic(&self.message.topic)
    }
}

/// Forwards dead letters through the client's shared publisher
pub(crate) struct DeadLetterRouter {
    publisher: Arc<Publisher>,
    metrics: Arc<dyn MetricsSink>,
    slug: String,
}

impl DeadLetterRouter {
    pub(crate) fn new(publisher: Arc<Publisher>, metrics: Arc<dyn MetricsSink>, slug: String) -> Self {
        Self {
            publisher,
            metrics,
            slug,
        }
    }

    /// Forward one letter, bounded by the publish timeout only
    ///
    /// Independent of the subscription's token: a stop during processing
    /// waits for the letter before the offset is committed.
    pub(crate) async fn route(&self, letter: DeadLetter) -> Result<DeliveryReport> {
        let topic = letter.topic();
        let message = letter.message.forward_to(&topic);
        let result = self
            .publisher
            .publish_sync(message, self.publisher.publish_timeout(), &CancellationToken::new())
            .await;

        self.metrics.message_dead_lettered(&self.slug, result.is_ok());

        match &result {
            Ok(report) => tracing::warn!(
                slug = %self.slug,
                dlq_topic = %topic,
                source_partition = letter.message.partition,
                source_offset = letter.message.offset,
                dlq_offset = report.offset,
                reason = %letter.reason,
                "Message dead-lettered"
            ),
            Err(e) => tracing::error!(
                slug = %self.slug,
                dlq_topic = %topic,
                source_offset = letter.message.offset,
                error = %e,
                "Dead-letter publish failed, offset still advances"
            ),
        }

        result
    }
}
