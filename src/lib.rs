//! # eventstream
//!
//! Publish and consume structured events and audit logs through a
//! pluggable message-broker backend.
//!
//! ## Overview
//!
//! Application code builds an event with `PublishBuilder`, hands it to a
//! `Client`, and registers callbacks with `SubscribeBuilder`. The backend
//! (Kafka, stdout, or a no-op sink) is chosen at construction time and is
//! invisible to the caller.
//!
//! ## Quick Start
//!
//! ```rust
//! use eventstream::provider::memory::MemoryBroker;
//! use eventstream::{BrokerClient, BrokerConfig, Client, PublishBuilder, SubscribeBuilder};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> eventstream::Result<()> {
//! let client = BrokerClient::with_transport(
//!     "dev",
//!     Arc::new(MemoryBroker::new()),
//!     BrokerConfig::default(),
//! )?;
//!
//! let cancel = CancellationToken::new();
//! let handle = client
//!     .register(
//!         SubscribeBuilder::new()
//!             .topic("orders")
//!             .group_id("billing")
//!             .event_name("created")
//!             .callback(|_ctx, event| async move {
//!                 println!("received {:?}", event?.payload);
//!                 Ok(())
//!             }),
//!         cancel.clone(),
//!     )
//!     .await?;
//!
//! client
//!     .publish_sync(
//!         PublishBuilder::new().topic("orders").event_name("created").key("order-1"),
//!         &cancel,
//!     )
//!     .await?;
//!
//! handle.stop();
//! handle.join().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **kafka** — `BrokerClient` over librdkafka (feature `kafka`)
//! - **stdout** — prints published events, for local development
//! - **none** — accepts and discards everything
//!
//! ## Architecture
//!
//! - **Client** trait — the contract every backend implements
//! - **Transport** trait — shared broker connection behind `BrokerClient`
//! - **Publisher** — timeout, retry and async error reporting
//! - **SubscriptionEngine** — poll loop, commit timing, dead-lettering

pub mod audit;
pub mod client;
pub mod config;
pub mod dlq;
pub mod error;
pub mod id;
pub mod metrics;
pub mod provider;
pub mod publish;
pub mod publisher;
pub mod subscribe;
pub mod subscriber;
pub mod types;
pub mod validation;

// Re-export core types
pub use audit::{AuditLogBuilder, AUDIT_LOG_TOPIC};
pub use client::{new_client, BlackholeClient, BrokerClient, Client, StdoutClient, StreamKind};
pub use config::{BrokerConfig, SecurityConfig};
pub use dlq::dead_letter_topic;
pub use error::{EventError, Result};
pub use id::{IdGenerator, UuidGenerator};
pub use metrics::{slug, MetricsSink, NoopMetrics, ProcessOutcome, PrometheusMetrics};
pub use provider::{Consumer, Transport};
pub use publish::{PublishBuilder, PublishErrorCallback};
pub use publisher::RetryPolicy;
pub use subscribe::{CallbackError, CallbackResult, SubscribeBuilder};
pub use subscriber::{SubscriptionHandle, SubscriptionState};
pub use types::{
    ActorType, AuditLog, AuditLogDiff, AuditLogPayload, Event, Fields, Message, Metadata,
    PartitionMetadata, StartOffset,
};
pub use validation::{AuditLogValidator, Validator};
