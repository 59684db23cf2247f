//! Broker-client capability.
//!
//! The relay never embeds a broker. It depends only on the [`BrokerClient`]
//! trait, which any message-broker backend can implement:
//!
//! - `publish` hands a record to the broker and returns a future that resolves
//!   once the broker acknowledges or rejects it
//! - `subscribe` opens a stream of raw records for one topic partition
//! - `commit` stores the consumer group's progress
//!
//! [`MemoryBroker`] is an in-process implementation used by the CLI and tests.
//! With the `kafka` feature, [`KafkaBroker`] talks to a real cluster.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;

/// Broker acknowledgement for one published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Partition the record was written to.
    pub partition: i32,
    /// Offset assigned by the broker.
    pub offset: i64,
}

/// Resolves to the broker's receipt, or the reason the record was rejected.
pub type DeliveryFuture = BoxFuture<'static, std::result::Result<DeliveryReceipt, String>>;

/// A raw record read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRecord {
    /// Record value as written by the producer.
    pub payload: Bytes,
    /// Offset of the record within its partition.
    pub offset: i64,
}

/// Stream of records for one topic partition.
pub type RecordStream = BoxStream<'static, Result<ReceivedRecord>>;

/// Capability the relay uses to talk to a message broker.
///
/// Implementations must be safe to share between the producer and consumer
/// as an `Arc<dyn BrokerClient>`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Ensure the broker is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BrokerUnavailable`](crate::RelayError::BrokerUnavailable)
    /// if no connection can be established.
    async fn connect(&self) -> Result<()>;

    /// Submit one record. The returned future resolves with the delivery
    /// outcome; the call itself only fails when the record could not be
    /// handed to the broker at all.
    async fn publish(&self, topic: &str, key: Option<Bytes>, payload: Bytes)
        -> Result<DeliveryFuture>;

    /// Open a subscription for `topic`/`partition` on behalf of `group_id`.
    async fn subscribe(&self, topic: &str, partition: i32, group_id: &str)
        -> Result<RecordStream>;

    /// Commit `offset` (the next offset to read) for the group.
    async fn commit(&self, group_id: &str, topic: &str, partition: i32, offset: i64)
        -> Result<()>;

    /// Release connections held by this client.
    async fn close(&self);
}
