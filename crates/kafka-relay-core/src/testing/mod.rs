//! Test utilities for the message relay.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBrokerClient`] - A scriptable broker client (ack, fail, hold, outage)
//! - [`RecordingHandler`] - A message handler that records what it receives
//! - [`RelayTestHarness`] - A coordinator wired to the mock client and handler
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_relay_core::testing::TestHarnessBuilder;
//!
//! #[tokio::test]
//! async fn test_failures_are_reported() {
//!     let harness = TestHarnessBuilder::new().build();
//!     harness.client.fail_sequences([17, 42]);
//!     harness.start().await.unwrap();
//!
//!     let result = harness.coordinator.send_batch(500).await.unwrap();
//!     assert_eq!(result.failed_sequences, vec![17, 42]);
//! }
//! ```

pub mod harness;
pub mod mock_client;

pub use harness::{RecordingHandler, RelayTestHarness, TestHarnessBuilder};
pub use mock_client::{CommitCall, MockBrokerClient, PublishedRecord};
