//! In-process broker.
//!
//! Keeps an append-only log per topic partition and acknowledges every
//! publish immediately. Subscriptions start at the group's committed offset
//! (earliest when the group has never committed) and follow the log as it
//! grows. Used by the CLI to run the relay loopback-style and by tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{RelayError, Result};

use super::{BrokerClient, DeliveryFuture, DeliveryReceipt, ReceivedRecord, RecordStream};

type PartitionKey = (String, i32);
type GroupKey = (String, String, i32);

/// Append-only log of one partition. Receivers are woken on every append.
type PartitionLog = Arc<watch::Sender<Vec<Bytes>>>;

/// An in-memory broker implementing [`BrokerClient`].
pub struct MemoryBroker {
    partitions_per_topic: i32,
    logs: DashMap<PartitionKey, PartitionLog>,
    committed: DashMap<GroupKey, i64>,
    available: AtomicBool,
    round_robin: AtomicUsize,
}

impl MemoryBroker {
    /// Create a broker with one partition per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Create a broker with `partitions` partitions per topic (at least 1).
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            partitions_per_topic: partitions.max(1),
            logs: DashMap::new(),
            committed: DashMap::new(),
            available: AtomicBool::new(true),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "memory broker availability changed");
    }

    /// Whether the broker currently accepts requests.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Snapshot of all records in a partition.
    #[must_use]
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Bytes> {
        self.logs
            .get(&(topic.to_string(), partition))
            .map(|log| log.borrow().clone())
            .unwrap_or_default()
    }

    /// Offset last committed by `group_id`, if any.
    #[must_use]
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|offset| *offset)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RelayError::unavailable("memory broker is offline"))
        }
    }

    fn log(&self, topic: &str, partition: i32) -> PartitionLog {
        let entry = self
            .logs
            .entry((topic.to_string(), partition))
            .or_insert_with(|| Arc::new(watch::channel(Vec::new()).0));
        Arc::clone(entry.value())
    }

    fn select_partition(&self, key: Option<&Bytes>) -> i32 {
        if self.partitions_per_topic == 1 {
            return 0;
        }

        let count = self.partitions_per_topic as usize;
        let index = match key {
            Some(key) => hash_partition(key, count),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };
        index as i32
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a hash of the key, reduced to a partition index.
fn hash_partition(key: &[u8], partition_count: usize) -> usize {
    let mut hash = 2_166_136_261u32;
    for byte in key {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    (hash as usize) % partition_count
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<DeliveryFuture> {
        self.ensure_available()?;

        let partition = self.select_partition(key.as_ref());
        let log = self.log(topic, partition);

        let mut offset = 0i64;
        log.send_modify(|records| {
            offset = records.len() as i64;
            records.push(payload);
        });

        debug!(topic, partition, offset, "record appended");

        let receipt = DeliveryReceipt { partition, offset };
        Ok(futures::future::ready(Ok(receipt)).boxed())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: i32,
        group_id: &str,
    ) -> Result<RecordStream> {
        self.ensure_available()?;

        if partition < 0 || partition >= self.partitions_per_topic {
            return Err(RelayError::Subscription {
                topic: topic.to_string(),
                partition,
                message: format!(
                    "partition out of range (topic has {} partitions)",
                    self.partitions_per_topic
                ),
            });
        }

        let start = self.committed_offset(group_id, topic, partition).unwrap_or(0);
        let receiver = self.log(topic, partition).subscribe();

        info!(topic, partition, group_id, start_offset = start, "subscription opened");

        let stream = futures::stream::unfold((receiver, start), |(mut rx, next)| async move {
            loop {
                let record = rx.borrow_and_update().get(next as usize).cloned();
                if let Some(payload) = record {
                    let item = ReceivedRecord {
                        payload,
                        offset: next,
                    };
                    return Some((Ok(item), (rx, next + 1)));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn commit(&self, group_id: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.ensure_available()?;

        self.committed.insert(
            (group_id.to_string(), topic.to_string(), partition),
            offset,
        );
        debug!(group_id, topic, partition, offset, "offset committed");
        Ok(())
    }

    async fn close(&self) {
        debug!("memory broker client closed");
    }
}
