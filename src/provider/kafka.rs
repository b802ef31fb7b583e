//! Kafka transport over librdkafka
//!
//! One `FutureProducer` is shared by every publish on the client; each
//! subscription gets its own `StreamConsumer` in its consumer group.
//! Broker-side auto-commit is disabled, the subscriber engine decides when
//! offsets are committed.

use super::{CommitMode, Consumer, ConsumerSpec, DeliveryFuture, TopicPartitionOffset, Transport};
use crate::config::BrokerConfig;
use crate::error::{EventError, Result};
use crate::types::{ConsumedMessage, DeliveryReport, Message, Metadata, PartitionMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::time::Duration;

/// Errors the producer recovers from by itself given time
fn is_retriable(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
        )
    )
}

fn transport_error(topic: &str, e: &KafkaError) -> EventError {
    EventError::Transport {
        topic: topic.to_string(),
        reason: e.to_string(),
        retriable: is_retriable(e),
    }
}

fn client_config(properties: &BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

/// Shared producer plus the properties new consumers are built from
pub struct KafkaTransport {
    producer: FutureProducer,
    properties: BTreeMap<String, String>,
}

impl KafkaTransport {
    /// Create the shared producer; no broker round-trip happens here
    pub fn connect(brokers: &[String], config: &BrokerConfig) -> Result<Self> {
        if brokers.is_empty() {
            return Err(EventError::Config("no broker addresses given".to_string()));
        }
        let properties = config.transport_properties(brokers)?;

        let producer: FutureProducer = client_config(&properties)
            .create()
            .map_err(|e| EventError::Config(format!("failed to create producer: {}", e)))?;

        tracing::info!(brokers = %brokers.join(","), "Kafka producer created");

        Ok(Self {
            producer,
            properties,
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, message: Message) -> Result<DeliveryFuture> {
        let topic = message.topic.clone();
        let mut record = FutureRecord::to(&message.topic).payload(&message.value[..]);
        if !message.key.is_empty() {
            record = record.key(&message.key[..]);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| transport_error(&topic, &e))?;

        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(DeliveryReport { partition, offset }),
                Ok(Err((e, _))) => Err(transport_error(&topic, &e)),
                Err(_) => Err(EventError::Transport {
                    topic,
                    reason: "producer dropped before delivery".to_string(),
                    retriable: false,
                }),
            }
        }
        .boxed())
    }

    async fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn Consumer>> {
        let mut config = client_config(&self.properties);
        config
            .set("group.id", &spec.group_id)
            .set("auto.offset.reset", spec.start_offset.reset_policy());
        if let Some(instance) = &spec.group_instance_id {
            config.set("group.instance.id", instance);
        }

        let consumer: StreamConsumer = config.create().map_err(|e| {
            EventError::Config(format!("failed to create consumer for '{}': {}", spec.topic, e))
        })?;
        consumer
            .subscribe(&[spec.topic.as_str()])
            .map_err(|e| transport_error(&spec.topic, &e))?;

        tracing::info!(
            topic = %spec.topic,
            group_id = %spec.group_id,
            start_offset = spec.start_offset.reset_policy(),
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: spec.topic.clone(),
        }))
    }

    async fn metadata(&self, topic: &str, timeout: Duration) -> Result<Metadata> {
        let producer = self.producer.clone();
        let name = topic.to_string();
        let fetched = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(Some(&name), timeout)
        })
        .await
        .map_err(|e| EventError::Transport {
            topic: topic.to_string(),
            reason: format!("metadata task failed: {}", e),
            retriable: false,
        })?
        .map_err(|e| match e.rdkafka_error_code() {
            Some(RDKafkaErrorCode::OperationTimedOut) => {
                EventError::Timeout(format!("metadata for '{}'", topic))
            }
            _ => transport_error(topic, &e),
        })?;

        let found = fetched
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| EventError::NotFound(topic.to_string()))?;

        Ok(Metadata {
            topic: topic.to_string(),
            partitions: found
                .partitions()
                .iter()
                .map(|p| PartitionMetadata {
                    id: p.id(),
                    leader: p.leader(),
                    replicas: p.replicas().to_vec(),
                })
                .collect(),
        })
    }

    fn name(&self) -> &str {
        "kafka"
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(transport_error(&self.topic, &e)),
            Ok(Ok(msg)) => Ok(Some(ConsumedMessage {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(Bytes::copy_from_slice).unwrap_or_default(),
                value: msg.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
            })),
        }
    }

    async fn commit(&mut self, offsets: &[TopicPartitionOffset], mode: CommitMode) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for tpo in offsets {
            list.add_partition_offset(&tpo.topic, tpo.partition, Offset::Offset(tpo.offset))
                .map_err(|e| transport_error(&tpo.topic, &e))?;
        }
        let mode = match mode {
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
        };
        self.consumer
            .commit(&list, mode)
            .map_err(|e| transport_error(&self.topic, &e))
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        tracing::debug!(topic = %self.topic, "Kafka consumer left group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(is_retriable(&KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
        )));
        assert!(!is_retriable(&KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge
        )));
    }

    #[test]
    fn test_connect_requires_brokers() {
        let err = KafkaTransport::connect(&[], &BrokerConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EventError::Config(_)));
    }

    #[test]
    fn test_connect_disables_broker_auto_commit() {
        let transport =
            KafkaTransport::connect(&["localhost:1".to_string()], &BrokerConfig::default()).unwrap();
        assert_eq!(transport.name(), "kafka");
        assert_eq!(transport.properties["enable.auto.commit"], "false");
    }
}
