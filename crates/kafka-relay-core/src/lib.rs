//! Kafka Relay Core Library
//!
//! This library provides an at-least-once message relay on top of an external
//! message broker. Every produced message is accounted for in a per-batch
//! delivery tracker, in-flight sends are bounded by a backpressure window, and
//! the consumer side deduplicates redeliveries and commits progress only past
//! gap-free runs of sequences.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`message`] - Message model and text wire codec
//! - [`tracker`] - Per-batch delivery accounting
//! - [`producer`] - Sequenced batch producer with backpressure
//! - [`consumer`] - Subscription consumer with dedup and contiguous commits
//! - [`coordinator`] - Lifecycle facade with retry and graceful shutdown
//! - [`broker`] - Broker-client capability, in-process broker and optional
//!   Kafka client
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kafka_relay_core::{Disposition, MemoryBroker, Message, RelayConfig, RelayCoordinator};
//!
//! let config = RelayConfig::from_file("config.yaml")?;
//! let handler = Arc::new(|m: &Message| {
//!     println!("received #{}", m.sequence());
//!     Disposition::Ack
//! });
//!
//! let relay = RelayCoordinator::new(config, Arc::new(MemoryBroker::new()), handler)?;
//! relay.start().await?;
//! let result = relay.send_batch(500).await?;
//! relay.stop().await;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod tracker;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
#[cfg(feature = "kafka")]
pub use broker::KafkaBroker;
pub use broker::{BrokerClient, DeliveryReceipt, MemoryBroker, ReceivedRecord};
pub use config::{BrokerKind, RelayConfig};
pub use consumer::{Disposition, MessageHandler, RelayConsumer, SessionSnapshot};
pub use coordinator::{ComponentState, RelayCoordinator, RelayStatus};
pub use error::{CodecError, ConfigError, RelayError, Result, TrackerError};
pub use message::{Batch, BatchId, Message, MessageCodec};
pub use metrics::{RelayMetrics, RelayStats};
pub use producer::RelayProducer;
pub use tracker::{BatchHandle, BatchResult, DeliveryOutcome, DeliveryTracker};
