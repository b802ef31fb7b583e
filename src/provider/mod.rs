//! Transport seam — the broker connection behind the broker-backed client
//!
//! A `Transport` is the shared connection handle: every publisher and
//! subscriber created from one client goes through the same instance.
//! Implementations only move bytes; timeouts, retries, commit timing and
//! dead-lettering live in the publisher and subscriber engines.

use crate::error::Result;
use crate::types::{ConsumedMessage, DeliveryReport, Message, Metadata, StartOffset};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

/// Resolves once the broker has acknowledged (or rejected) a message
pub type DeliveryFuture = BoxFuture<'static, Result<DeliveryReport>>;

/// Shared broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue a message for delivery
    ///
    /// Returns once the message is accepted into the outgoing queue; the
    /// returned future resolves with the broker's acknowledgement. An
    /// `Err` here means the message was never enqueued.
    async fn send(&self, message: Message) -> Result<DeliveryFuture>;

    /// Join a consumer group and subscribe to one topic
    async fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn Consumer>>;

    /// Topic and partition information, bounded by `timeout`
    async fn metadata(&self, topic: &str, timeout: Duration) -> Result<Metadata>;

    /// Transport name (e.g., "kafka", "memory")
    fn name(&self) -> &str;
}

/// Parameters for joining a consumer group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub topic: String,
    pub group_id: String,
    pub group_instance_id: Option<String>,
    pub start_offset: StartOffset,
}

/// Whether a commit call waits for the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

/// Position to commit: the next offset to read in a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl TopicPartitionOffset {
    /// Commit position that marks `msg` as consumed
    pub fn after(msg: &ConsumedMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset + 1,
        }
    }
}

/// One consumer group member, owned by a single subscription loop
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait up to `timeout` for the next message; `None` when nothing arrived
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>>;

    /// Commit consumed positions for this group
    async fn commit(&mut self, offsets: &[TopicPartitionOffset], mode: CommitMode) -> Result<()>;

    /// Leave the group and release resources
    async fn close(&mut self) -> Result<()>;
}
