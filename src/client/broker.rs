//! Broker-backed client
//!
//! All publishes and subscriptions created from one `BrokerClient` share a
//! single transport connection and a single publisher engine.

use super::Client;
use crate::audit::AuditLogBuilder;
use crate::config::BrokerConfig;
use crate::dlq::DeadLetterRouter;
use crate::error::{EventError, Result};
use crate::id::{IdGenerator, UuidGenerator};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::provider::{ConsumerSpec, Transport};
use crate::publish::PublishBuilder;
use crate::publisher::{Publisher, RetryPolicy};
use crate::subscribe::SubscribeBuilder;
use crate::subscriber::{
    CommitPolicy, Registrations, SubscriptionEngine, SubscriptionHandle,
};
use crate::types::{Message, Metadata};
use crate::validation::{AuditLogValidator, Validator};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Client over a shared broker transport
pub struct BrokerClient {
    prefix: String,
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    publisher: Arc<Publisher>,
    metrics: Arc<dyn MetricsSink>,
    ids: Arc<dyn IdGenerator>,
    validator: Arc<dyn Validator>,
    registrations: Arc<Registrations>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("prefix", &self.prefix)
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .finish()
    }
}

impl BrokerClient {
    /// Build a client over an existing transport
    pub fn with_transport(
        prefix: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: BrokerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = config.normalized();
        let metrics: Arc<dyn MetricsSink> = config
            .metrics
            .clone()
            .unwrap_or_else(|| Arc::new(NoopMetrics));
        let publisher = Arc::new(Publisher::new(
            transport.clone(),
            metrics.clone(),
            config.publish_timeout,
        ));

        Ok(Self {
            prefix: prefix.into(),
            transport,
            config,
            publisher,
            metrics,
            ids: Arc::new(UuidGenerator),
            validator: Arc::new(AuditLogValidator),
            registrations: Arc::new(Registrations::default()),
        })
    }

    /// Connect to Kafka brokers
    #[cfg(feature = "kafka")]
    pub fn connect_kafka(
        prefix: impl Into<String>,
        brokers: &[String],
        config: BrokerConfig,
    ) -> Result<Self> {
        let transport = crate::provider::kafka::KafkaTransport::connect(brokers, &config)?;
        Self::with_transport(prefix, Arc::new(transport), config)
    }

    /// Replace the ID source used for generated event, audit-log and group IDs
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Replace the audit-log validator
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the publish retry backoff
    ///
    /// Must be called before the client is shared; it rebuilds the publisher.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.publisher = Arc::new(
            Publisher::new(
                self.transport.clone(),
                self.metrics.clone(),
                self.config.publish_timeout,
            )
            .with_retry(retry),
        );
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether a subscription with `slug` is currently live
    pub fn is_registered(&self, slug: &str) -> bool {
        self.registrations.contains(slug)
    }

    /// Apply the client prefix to a topic or group name
    pub fn prefixed(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn build_event(&self, builder: PublishBuilder) -> Result<Message> {
        let mut message = builder.build_with(self.ids.as_ref(), self.config.strict_validation)?;
        message.topic = self.prefixed(&message.topic);
        Ok(message)
    }

    fn commit_policy(&self, async_commit: bool) -> CommitPolicy {
        CommitPolicy {
            before_processing: self.config.commit_before_processing,
            auto_commit_interval: if self.config.disable_auto_commit {
                None
            } else {
                Some(self.config.auto_commit_interval)
            },
            async_flush: async_commit,
        }
    }
}

#[async_trait]
impl Client for BrokerClient {
    async fn publish(&self, mut builder: PublishBuilder) -> Result<()> {
        let requested = builder.timeout_override();
        let callback = builder.take_error_callback();
        let message = self.build_event(builder)?;
        let timeout = self.publisher.resolve_timeout(requested);
        self.publisher.publish(message, timeout, callback);
        Ok(())
    }

    async fn publish_sync(&self, builder: PublishBuilder, cancel: &CancellationToken) -> Result<()> {
        let requested = builder.timeout_override();
        let message = self.build_event(builder)?;
        let timeout = self.publisher.resolve_timeout(requested);
        self.publisher.publish_sync(message, timeout, cancel).await?;
        Ok(())
    }

    async fn register(
        &self,
        mut builder: SubscribeBuilder,
        cancel: CancellationToken,
    ) -> Result<SubscriptionHandle> {
        builder.validate()?;
        if builder.group_id.is_empty() {
            builder.group_id = self.ids.generate();
        }

        let slug = builder.slug();
        let registration = self.registrations.claim(&slug)?;

        let topic = self.prefixed(&builder.topic);
        let spec = ConsumerSpec {
            topic,
            group_id: self.prefixed(&builder.group_id),
            group_instance_id: (!builder.group_instance_id.is_empty())
                .then(|| builder.group_instance_id.clone()),
            start_offset: builder.start_offset,
        };
        let consumer = self.transport.consumer(&spec).await?;

        let handler = builder
            .handler
            .take()
            .ok_or_else(|| EventError::validation("callback", "required"))?;
        let dlq = builder.send_error_dlq.then(|| {
            DeadLetterRouter::new(self.publisher.clone(), self.metrics.clone(), slug.clone())
        });

        let (engine, state) = SubscriptionEngine::new(
            slug.clone(),
            builder.event_name.clone(),
            handler,
            consumer,
            self.commit_policy(builder.async_commit_message),
            dlq,
            self.metrics.clone(),
            cancel.clone(),
            registration,
        );

        tracing::info!(
            slug = %slug,
            topic = %spec.topic,
            group_id = %spec.group_id,
            dlq = builder.send_error_dlq,
            "Subscription registered"
        );

        let task = tokio::spawn(engine.run());
        Ok(SubscriptionHandle::spawned(slug, cancel, state, task))
    }

    async fn publish_audit_log(
        &self,
        builder: AuditLogBuilder,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut message = builder.build_with(self.ids.as_ref(), self.validator.as_ref())?;
        message.topic = self.prefixed(&message.topic);
        self.publisher
            .publish_sync(message, self.publisher.publish_timeout(), cancel)
            .await?;
        Ok(())
    }

    async fn get_metadata(&self, topic: &str, timeout: Duration) -> Result<Metadata> {
        let topic = self.prefixed(topic);
        match tokio::time::timeout(timeout, self.transport.metadata(&topic, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(EventError::Timeout(format!(
                "metadata for '{}' after {}ms",
                topic,
                timeout.as_millis()
            ))),
        }
    }

    fn name(&self) -> &str {
        self.transport.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryBroker;

    fn client(prefix: &str, broker: &MemoryBroker) -> BrokerClient {
        BrokerClient::with_transport(prefix, Arc::new(broker.clone()), BrokerConfig::default())
            .unwrap()
    }

    #[test]
    fn test_prefixed_names() {
        let broker = MemoryBroker::new();
        assert_eq!(client("", &broker).prefixed("orders"), "orders");
        assert_eq!(client("prod", &broker).prefixed("orders"), "prod.orders");
    }

    #[test]
    fn test_commit_policy_from_config() {
        let broker = MemoryBroker::new();
        let config = BrokerConfig {
            disable_auto_commit: true,
            commit_before_processing: true,
            ..Default::default()
        };
        let client = BrokerClient::with_transport("", Arc::new(broker), config).unwrap();
        let policy = client.commit_policy(false);
        assert!(policy.before_processing);
        assert_eq!(policy.auto_commit_interval, None);

        let client = client_default();
        assert_eq!(
            client.commit_policy(true).auto_commit_interval,
            Some(Duration::from_secs(1))
        );
    }

    fn client_default() -> BrokerClient {
        client("", &MemoryBroker::new())
    }

    #[tokio::test]
    async fn test_publish_sync_applies_prefix() {
        let broker = MemoryBroker::new();
        let client = client("prod", &broker);
        client
            .publish_sync(
                PublishBuilder::new().topic("orders").event_name("created"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(broker.messages("prod.orders").len(), 1);
        assert!(broker.messages("orders").is_empty());
    }

    #[tokio::test]
    async fn test_register_generates_group_id() {
        let client = client_default();
        let handle = client
            .register(
                SubscribeBuilder::new()
                    .topic("orders")
                    .callback(|_ctx, _event| async { Ok(()) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let group = handle.slug().rsplit('.').next().unwrap().to_string();
        assert_eq!(group.len(), 32);
        assert!(client.is_registered(handle.slug()));

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = BrokerConfig {
            security_config: Some(crate::config::SecurityConfig {
                authentication_type: "SASL".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = BrokerClient::with_transport("", Arc::new(MemoryBroker::new()), config);
        assert!(matches!(result, Err(EventError::Config(_))));
    }
}
