//! Client facade — one trait, three backends
//!
//! `new_client` selects a backend by name:
//!
//! - **kafka** — `BrokerClient` over a broker transport (requires the
//!   `kafka` feature)
//! - **stdout** — `StdoutClient`, prints published events
//! - **none** — `BlackholeClient`, accepts and discards everything
//!
//! All three satisfy the same contract so application code is unaware of
//! which one it holds.

use crate::audit::AuditLogBuilder;
use crate::config::BrokerConfig;
use crate::error::{EventError, Result};
use crate::publish::PublishBuilder;
use crate::subscribe::SubscribeBuilder;
use crate::subscriber::SubscriptionHandle;
use crate::types::Metadata;
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod blackhole;
pub mod broker;
pub mod stdout;

pub use blackhole::BlackholeClient;
pub use broker::BrokerClient;
pub use stdout::StdoutClient;

/// Publish / subscribe contract shared by every backend
#[async_trait]
pub trait Client: Send + Sync {
    /// Fire-and-forget publish
    ///
    /// Returns once the event is built and handed to the backend. Delivery
    /// failures are reported to the builder's error callback.
    async fn publish(&self, builder: PublishBuilder) -> Result<()>;

    /// Publish and wait for the broker acknowledgement
    ///
    /// Fails with `PublishTimeout` if no acknowledgement arrives in time,
    /// or `Cancelled` if `cancel` fires first.
    async fn publish_sync(&self, builder: PublishBuilder, cancel: &CancellationToken) -> Result<()>;

    /// Start a subscription; it runs until `cancel` fires or the handle is
    /// stopped. Only one live subscription per slug is allowed.
    async fn register(
        &self,
        builder: SubscribeBuilder,
        cancel: CancellationToken,
    ) -> Result<SubscriptionHandle>;

    /// Validate and synchronously publish one audit-log record
    async fn publish_audit_log(
        &self,
        builder: AuditLogBuilder,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Partition information for `topic`, bounded by `timeout`
    async fn get_metadata(&self, topic: &str, timeout: Duration) -> Result<Metadata>;

    /// Backend name (e.g., "kafka", "stdout", "none")
    fn name(&self) -> &str;
}

/// Backend selector accepted by `new_client`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    None,
    Stdout,
    Kafka,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::None => "none",
            StreamKind::Stdout => "stdout",
            StreamKind::Kafka => "kafka",
        }
    }
}

impl FromStr for StreamKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(StreamKind::None),
            "stdout" => Ok(StreamKind::Stdout),
            "kafka" => Ok(StreamKind::Kafka),
            other => Err(EventError::Config(format!(
                "unsupported stream '{}', expected one of: none, stdout, kafka",
                other
            ))),
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create a client for the named backend
///
/// `prefix` is prepended to every topic and group ID as `<prefix>.<name>`.
/// `brokers` and `config` are only used by the kafka backend.
pub fn new_client(
    prefix: &str,
    stream: &str,
    brokers: &[String],
    config: Option<BrokerConfig>,
) -> Result<Box<dyn Client>> {
    let kind: StreamKind = stream.parse()?;
    tracing::debug!(stream = %kind, prefix, "Creating event stream client");

    match kind {
        StreamKind::None => Ok(Box::new(BlackholeClient::new())),
        StreamKind::Stdout => Ok(Box::new(StdoutClient::new(prefix))),
        StreamKind::Kafka => kafka_client(prefix, brokers, config.unwrap_or_default()),
    }
}

#[cfg(feature = "kafka")]
fn kafka_client(prefix: &str, brokers: &[String], config: BrokerConfig) -> Result<Box<dyn Client>> {
    Ok(Box::new(BrokerClient::connect_kafka(prefix, brokers, config)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka_client(_prefix: &str, _brokers: &[String], _config: BrokerConfig) -> Result<Box<dyn Client>> {
    Err(EventError::Config(
        "kafka stream requested but the `kafka` feature is not enabled".to_string(),
    ))
}
