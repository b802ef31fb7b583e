//! In-process broker transport
//!
//! Keeps partitioned topic logs and consumer-group offsets in memory.
//! Suited to tests and single-process use. Every consumer of a group is
//! handed all partitions; there is no rebalancing.
//!
//! Delivery behavior can be steered to exercise failure paths: stall
//! acknowledgements, reject sends, fail the next N sends with a transient
//! error, or permanently reject one topic.

use super::{CommitMode, Consumer, ConsumerSpec, DeliveryFuture, TopicPartitionOffset, Transport};
use crate::error::{EventError, Result};
use crate::types::{
    ConsumedMessage, DeliveryReport, Message, Metadata, PartitionMetadata, StartOffset,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// How the broker answers `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckBehavior {
    /// Append and acknowledge right away
    Immediate,
    /// Accept the message but never acknowledge it
    Never,
    /// Refuse every message with a permanent error
    Reject(String),
}

/// A recorded commit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group_id: String,
    pub offset: TopicPartitionOffset,
    pub mode: CommitMode,
}

struct State {
    partitions: usize,
    topics: HashMap<String, Vec<Vec<ConsumedMessage>>>,
    committed: HashMap<(String, String, i32), i64>,
    commits: Vec<CommitRecord>,
    ack: AckBehavior,
    transient_failures: u32,
    rejected_topics: HashSet<String>,
    metadata_delay: Option<Duration>,
    round_robin: usize,
    active_consumers: HashMap<String, usize>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// In-memory broker; clones share the same logs
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker whose topics have a single partition
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker whose topics are created with `partitions` partitions
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    partitions: partitions.max(1),
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    commits: Vec::new(),
                    ack: AckBehavior::Immediate,
                    transient_failures: 0,
                    rejected_topics: HashSet::new(),
                    metadata_delay: None,
                    round_robin: 0,
                    active_consumers: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner)
    }

    pub fn set_ack_behavior(&self, ack: AckBehavior) {
        self.state().ack = ack;
    }

    /// Fail the next `count` sends with a retriable error
    pub fn fail_next_sends(&self, count: u32) {
        self.state().transient_failures = count;
    }

    /// Permanently refuse messages for `topic`
    pub fn reject_topic(&self, topic: impl Into<String>) {
        self.state().rejected_topics.insert(topic.into());
    }

    /// Delay metadata answers by `delay`
    pub fn set_metadata_delay(&self, delay: Duration) {
        self.state().metadata_delay = Some(delay);
    }

    /// Create a topic up front so metadata and `Latest` consumers see it
    pub fn create_topic(&self, topic: impl Into<String>) {
        let mut state = self.state();
        let partitions = state.partitions;
        state
            .topics
            .entry(topic.into())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    /// All messages stored for `topic`, partition by partition
    pub fn messages(&self, topic: &str) -> Vec<ConsumedMessage> {
        self.state()
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed position of a group on one partition
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Commit calls made by a group, in order
    pub fn commits(&self, group_id: &str) -> Vec<CommitRecord> {
        self.state()
            .commits
            .iter()
            .filter(|c| c.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Open consumers for a group
    pub fn active_consumers(&self, group_id: &str) -> usize {
        self.state()
            .active_consumers
            .get(group_id)
            .copied()
            .unwrap_or(0)
    }
}

fn lock(inner: &Inner) -> MutexGuard<'_, State> {
    // Recover from poisoning; each mutation completes under a single guard
    inner.state.lock().unwrap_or_else(|e| e.into_inner())
}

fn partition_for(key: &[u8], partitions: usize, round_robin: &mut usize) -> usize {
    if key.is_empty() {
        *round_robin = round_robin.wrapping_add(1);
        return *round_robin % partitions;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn send(&self, message: Message) -> Result<DeliveryFuture> {
        let mut state = self.state();

        if state.rejected_topics.contains(&message.topic) {
            let err = EventError::Transport {
                topic: message.topic,
                reason: "topic rejected by broker".to_string(),
                retriable: false,
            };
            return Ok(futures::future::ready(Err(err)).boxed());
        }

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            let err = EventError::Transport {
                topic: message.topic,
                reason: "broker not available".to_string(),
                retriable: true,
            };
            return Ok(futures::future::ready(Err(err)).boxed());
        }

        match state.ack.clone() {
            AckBehavior::Never => return Ok(futures::future::pending().boxed()),
            AckBehavior::Reject(reason) => {
                let err = EventError::Transport {
                    topic: message.topic,
                    reason,
                    retriable: false,
                };
                return Ok(futures::future::ready(Err(err)).boxed());
            }
            AckBehavior::Immediate => {}
        }

        let partitions = state.partitions;
        let index = {
            let State { round_robin, .. } = &mut *state;
            partition_for(&message.key, partitions, round_robin)
        };
        let log = state
            .topics
            .entry(message.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let offset = log[index].len() as i64;
        log[index].push(ConsumedMessage {
            topic: message.topic,
            partition: index as i32,
            offset,
            key: message.key,
            value: message.value,
        });
        drop(state);

        self.inner.notify.notify_waiters();

        let report = DeliveryReport {
            partition: index as i32,
            offset,
        };
        Ok(futures::future::ready(Ok(report)).boxed())
    }

    async fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn Consumer>> {
        let mut state = self.state();
        let mut positions = HashMap::new();
        if let Some(parts) = state.topics.get(&spec.topic) {
            for (index, log) in parts.iter().enumerate() {
                let partition = index as i32;
                let key = (spec.group_id.clone(), spec.topic.clone(), partition);
                let start = match state.committed.get(&key) {
                    Some(committed) => *committed,
                    None => match spec.start_offset {
                        StartOffset::Earliest => 0,
                        StartOffset::Latest => log.len() as i64,
                    },
                };
                positions.insert(partition, start);
            }
        }
        *state
            .active_consumers
            .entry(spec.group_id.clone())
            .or_insert(0) += 1;

        tracing::debug!(
            topic = %spec.topic,
            group = %spec.group_id,
            "Memory consumer joined group"
        );

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            spec: spec.clone(),
            positions,
            next_partition: 0,
            closed: false,
        }))
    }

    async fn metadata(&self, topic: &str, _timeout: Duration) -> Result<Metadata> {
        let delay = self.state().metadata_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        let parts = state
            .topics
            .get(topic)
            .ok_or_else(|| EventError::NotFound(format!("topic '{}'", topic)))?;
        Ok(Metadata {
            topic: topic.to_string(),
            partitions: (0..parts.len() as i32)
                .map(|id| PartitionMetadata {
                    id,
                    leader: 0,
                    replicas: vec![0],
                })
                .collect(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Consumer handed out by `MemoryBroker`
struct MemoryConsumer {
    inner: Arc<Inner>,
    spec: ConsumerSpec,
    /// Next offset to read per partition
    positions: HashMap<i32, i64>,
    next_partition: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn take_next(&mut self) -> Option<ConsumedMessage> {
        let state = lock(&self.inner);
        let parts = state.topics.get(&self.spec.topic)?;
        let count = parts.len();
        for step in 0..count {
            let index = (self.next_partition + step) % count;
            let position = self.positions.entry(index as i32).or_insert(0);
            if let Some(msg) = parts[index].get(*position as usize) {
                *position += 1;
                self.next_partition = (index + 1) % count;
                return Some(msg.clone());
            }
        }
        None
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>> {
        if self.closed {
            return Err(EventError::Transport {
                topic: self.spec.topic.clone(),
                reason: "consumer closed".to_string(),
                retriable: false,
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inner = self.inner.clone();
            // Registered before the check so a publish in between still wakes us
            let notified = inner.notify.notified();

            if let Some(msg) = self.take_next() {
                return Ok(Some(msg));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, offsets: &[TopicPartitionOffset], mode: CommitMode) -> Result<()> {
        let mut state = lock(&self.inner);
        for tpo in offsets {
            state.committed.insert(
                (self.spec.group_id.clone(), tpo.topic.clone(), tpo.partition),
                tpo.offset,
            );
            state.commits.push(CommitRecord {
                group_id: self.spec.group_id.clone(),
                offset: tpo.clone(),
                mode,
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = lock(&self.inner);
        if let Some(count) = state.active_consumers.get_mut(&self.spec.group_id) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}
