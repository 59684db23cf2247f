//! Test harness for integration testing of the relay.
//!
//! Provides a complete test environment with:
//! - Scriptable mock broker client
//! - Recording message handler
//! - Relay coordinator with fast retry and shutdown settings

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::RelayConfig;
use crate::consumer::{Disposition, MessageHandler};
use crate::coordinator::RelayCoordinator;
use crate::message::Message;

use super::mock_client::MockBrokerClient;

/// Handler that records every message it sees and rejects a chosen set of
/// sequences.
pub struct RecordingHandler {
    messages: Mutex<Vec<Message>>,
    acked: Mutex<Vec<u64>>,
    reject: HashSet<u64>,
    count: watch::Sender<usize>,
}

impl RecordingHandler {
    /// A handler that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        Self::rejecting([])
    }

    /// A handler that rejects the given sequences.
    #[must_use]
    pub fn rejecting(sequences: impl IntoIterator<Item = u64>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            messages: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            reject: sequences.into_iter().collect(),
            count,
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every message received, in callback order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        Self::lock(&self.messages).clone()
    }

    /// Sequences received, in callback order.
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        Self::lock(&self.messages)
            .iter()
            .map(Message::sequence)
            .collect()
    }

    /// Sequences acknowledged, in callback order.
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        Self::lock(&self.acked).clone()
    }

    /// Wait until at least `count` callbacks have run.
    pub async fn wait_for_count(&self, count: usize) {
        let mut rx = self.count.subscribe();
        let _ = tokio::time::timeout(
            Duration::from_secs(30),
            rx.wait_for(|seen| *seen >= count),
        )
        .await;
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, message: &Message) -> Disposition {
        let disposition = if self.reject.contains(&message.sequence()) {
            Disposition::Reject
        } else {
            Self::lock(&self.acked).push(message.sequence());
            Disposition::Ack
        };

        let seen = {
            let mut messages = Self::lock(&self.messages);
            messages.push(message.clone());
            messages.len()
        };
        self.count.send_replace(seen);

        disposition
    }
}

/// Test harness for integration testing.
pub struct RelayTestHarness {
    /// The scriptable broker client
    pub client: Arc<MockBrokerClient>,
    /// The handler receiving consumed messages
    pub handler: Arc<RecordingHandler>,
    /// The coordinator under test
    pub coordinator: Arc<RelayCoordinator>,
}

impl RelayTestHarness {
    /// Create a harness with default test settings.
    ///
    /// # Panics
    ///
    /// Panics if the default test configuration is invalid.
    #[must_use]
    pub fn new() -> Self {
        TestHarnessBuilder::new().build()
    }

    /// Start the coordinator.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's start error.
    pub async fn start(&self) -> crate::error::Result<crate::coordinator::RelayStatus> {
        self.coordinator.start().await
    }

    /// Stop the coordinator.
    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }

    /// Wait until the consumer's commit point reaches `sequence`.
    ///
    /// Returns false if the consumer is not running or the wait timed out.
    pub async fn wait_for_commit(&self, sequence: u64) -> bool {
        let Some(consumer) = self.coordinator.consumer().await else {
            return false;
        };
        let mut rx = consumer.watch_session();
        let reached = tokio::time::timeout(
            Duration::from_secs(30),
            rx.wait_for(|s| s.last_committed >= sequence),
        )
        .await;
        matches!(reached, Ok(Ok(_)))
    }
}

impl Default for RelayTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating a test harness with specific configuration.
pub struct TestHarnessBuilder {
    config: RelayConfig,
    reject: Vec<u64>,
    loopback: bool,
}

impl TestHarnessBuilder {
    /// Create a new builder with test-friendly defaults: millisecond
    /// backoffs, three attempts and a one-second grace period.
    #[must_use]
    pub fn new() -> Self {
        let mut config = RelayConfig::default();
        config.producer.topic = "relay-test".to_string();
        config.consumer.topic = "relay-test".to_string();
        config.consumer.group_id = "relay-test-group".to_string();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 10;
        config.retry.max_attempts = 3;
        config.shutdown.grace_period_ms = 1_000;
        config.metrics.enabled = false;

        Self {
            config,
            reject: Vec::new(),
            loopback: true,
        }
    }

    /// Bound the producer's in-flight window.
    #[must_use]
    pub fn max_in_flight(mut self, window: usize) -> Self {
        self.config.producer.max_in_flight = Some(window);
        self
    }

    /// Set the per-batch deadline.
    #[must_use]
    pub fn batch_deadline_ms(mut self, deadline: u64) -> Self {
        self.config.producer.batch_deadline_ms = Some(deadline);
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn grace_period_ms(mut self, grace: u64) -> Self {
        self.config.shutdown.grace_period_ms = grace;
        self
    }

    /// Set the number of broker attempts per operation.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Enable or disable the consumer.
    #[must_use]
    pub fn consumer_enabled(mut self, enabled: bool) -> Self {
        self.config.consumer.enabled = enabled;
        self
    }

    /// Set the consumer's gap hold timeout.
    #[must_use]
    pub fn gap_hold_timeout_ms(mut self, hold: u64) -> Self {
        self.config.consumer.gap_hold_timeout_ms = hold;
        self
    }

    /// Have the handler reject the given sequences.
    #[must_use]
    pub fn reject(mut self, sequences: impl IntoIterator<Item = u64>) -> Self {
        self.reject.extend(sequences);
        self
    }

    /// Feed published records back into the subscription (default on).
    #[must_use]
    pub fn loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    /// Build the test harness.
    ///
    /// # Panics
    ///
    /// Panics if the resulting configuration is invalid.
    #[must_use]
    pub fn build(self) -> RelayTestHarness {
        let client = Arc::new(MockBrokerClient::new());
        client.set_loopback(self.loopback);
        let handler = Arc::new(RecordingHandler::rejecting(self.reject));

        let coordinator = RelayCoordinator::new(self.config, client.clone(), handler.clone())
            .map(Arc::new)
            .expect("test harness configuration should be valid");

        RelayTestHarness {
            client,
            handler,
            coordinator,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
