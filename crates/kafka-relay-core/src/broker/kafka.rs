//! Kafka broker client backed by librdkafka.
//!
//! Publishing goes through one shared [`FutureProducer`]. Every subscription
//! gets its own [`StreamConsumer`], assigned to exactly one partition with
//! auto-commit disabled, so the relay's contiguous commits are the only
//! progress the group records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{BrokerClient, DeliveryFuture, DeliveryReceipt, ReceivedRecord, RecordStream};
use crate::config::BrokerConfig;
use crate::error::{RelayError, Result};

/// Timeout for metadata requests and the final flush.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery timeout handed to librdkafka, in milliseconds.
const MESSAGE_TIMEOUT_MS: &str = "5000";

type SubscriptionKey = (String, String, i32);

/// [`BrokerClient`] for a Kafka cluster.
pub struct KafkaBroker {
    base: ClientConfig,
    producer: FutureProducer,
    consumers: DashMap<SubscriptionKey, Arc<StreamConsumer>>,
}

impl KafkaBroker {
    /// Create the client. No connection is made until
    /// [`connect`](BrokerClient::connect).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BrokerUnavailable`] if librdkafka rejects the
    /// producer configuration.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let base = client_config(config);

        let producer: FutureProducer = base
            .clone()
            .set("message.timeout.ms", MESSAGE_TIMEOUT_MS)
            .create()
            .map_err(|e| RelayError::unavailable(format!("cannot create kafka producer: {e}")))?;

        debug!(
            bootstrap_servers = ?config.bootstrap_servers(),
            client_id = %config.client_id(),
            "kafka client created"
        );

        Ok(Self {
            base,
            producer,
            consumers: DashMap::new(),
        })
    }

    fn consumer_for(&self, group_id: &str, topic: &str, partition: i32) -> Option<Arc<StreamConsumer>> {
        self.consumers
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|entry| Arc::clone(entry.value()))
    }
}

/// librdkafka settings shared by the producer and every consumer.
fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers().join(","))
        .set("client.id", config.client_id());
    client
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn connect(&self) -> Result<()> {
        let producer = self.producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, REQUEST_TIMEOUT)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| RelayError::unavailable(format!("metadata request aborted: {e}")))?;

        let brokers = metadata.map_err(|e| RelayError::unavailable(e.to_string()))?;
        info!(brokers, "connected to kafka cluster");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<DeliveryFuture> {
        let record = FutureRecord::<[u8], [u8]>::to(topic).payload(&payload[..]);
        let record = match key.as_deref() {
            Some(key) => record.key(key),
            None => record,
        };

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| RelayError::unavailable(e.to_string()))?;

        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(DeliveryReceipt { partition, offset }),
                Ok(Err((e, _))) => Err(e.to_string()),
                Err(_) => Err("delivery cancelled by producer".to_string()),
            }
        }
        .boxed())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: i32,
        group_id: &str,
    ) -> Result<RecordStream> {
        let subscription_error = |message: String| RelayError::Subscription {
            topic: topic.to_string(),
            partition,
            message,
        };

        let consumer: StreamConsumer = self
            .base
            .clone()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| subscription_error(e.to_string()))?;

        // No explicit offset: resume from the group's committed offset.
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(topic, partition);
        consumer
            .assign(&assignment)
            .map_err(|e| subscription_error(e.to_string()))?;

        let consumer = Arc::new(consumer);
        self.consumers.insert(
            (group_id.to_string(), topic.to_string(), partition),
            Arc::clone(&consumer),
        );
        info!(topic, partition, group_id, "kafka partition assigned");

        let records = futures::stream::unfold(consumer, |consumer| async move {
            let record = match consumer.recv().await {
                Ok(message) => Ok(ReceivedRecord {
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    offset: message.offset(),
                }),
                Err(e) => Err(RelayError::unavailable(e.to_string())),
            };
            Some((record, consumer))
        });

        Ok(records.boxed())
    }

    async fn commit(&self, group_id: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let consumer = self
            .consumer_for(group_id, topic, partition)
            .ok_or_else(|| RelayError::Subscription {
                topic: topic.to_string(),
                partition,
                message: format!("no subscription for group {group_id}"),
            })?;

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| RelayError::unavailable(e.to_string()))?;

        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| RelayError::unavailable(e.to_string()))
    }

    async fn close(&self) {
        self.consumers.clear();

        let producer = self.producer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(REQUEST_TIMEOUT)).await;
        match flushed {
            Ok(Ok(())) => debug!("kafka producer flushed"),
            Ok(Err(e)) => warn!(error = %e, "kafka producer flush failed"),
            Err(e) => warn!(error = %e, "kafka producer flush aborted"),
        }
    }
}
