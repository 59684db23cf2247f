//! Prometheus metrics for the message relay.
//!
//! Provides counters and gauges for monitoring delivery accounting, consumer
//! progress and broker retries.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Read-only snapshot of the relay's delivery accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_sent: u64,
    pub total_acked: u64,
    pub total_failed: u64,
    pub last_committed: u64,
}

/// Relay metrics collection.
///
/// Contains all metrics exposed by the relay for monitoring.
pub struct RelayMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Messages handed to the broker.
    pub messages_sent: IntCounter,

    /// Messages acknowledged by the broker.
    pub messages_acked: IntCounter,

    /// Messages that failed delivery.
    pub messages_failed: IntCounter,

    /// Sends submitted but not yet resolved.
    pub in_flight: IntGauge,

    /// Finished batches by result (completed, timed_out, cancelled).
    pub batches: IntCounterVec,

    /// Records received from the subscription.
    pub records_received: IntCounter,

    /// Records skipped by the consumer, by reason (malformed, duplicate).
    pub records_skipped: IntCounterVec,

    /// Callback invocations by disposition (ack, reject).
    pub messages_handled: IntCounterVec,

    /// Sequences skipped after a gap hold timeout.
    pub sequences_gapped: IntCounter,

    /// Highest contiguously committed sequence.
    pub last_committed: IntGauge,

    /// Failed offset commits.
    pub commit_errors: IntCounter,

    /// Retries after broker-unavailable failures, by operation.
    pub broker_retries: IntCounterVec,
}

impl RelayMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_sent = IntCounter::new(
            "kafka_relay_messages_sent_total",
            "Total number of messages handed to the broker",
        )
        .expect("metric creation should succeed");

        let messages_acked = IntCounter::new(
            "kafka_relay_messages_acked_total",
            "Total number of messages acknowledged by the broker",
        )
        .expect("metric creation should succeed");

        let messages_failed = IntCounter::new(
            "kafka_relay_messages_failed_total",
            "Total number of messages that failed delivery",
        )
        .expect("metric creation should succeed");

        let in_flight = IntGauge::new(
            "kafka_relay_in_flight",
            "Current number of submitted but unresolved sends",
        )
        .expect("metric creation should succeed");

        let batches = IntCounterVec::new(
            Opts::new("kafka_relay_batches_total", "Total number of finished batches by result"),
            &["result"],
        )
        .expect("metric creation should succeed");

        let records_received = IntCounter::new(
            "kafka_relay_records_received_total",
            "Total number of records received from the subscription",
        )
        .expect("metric creation should succeed");

        let records_skipped = IntCounterVec::new(
            Opts::new(
                "kafka_relay_records_skipped_total",
                "Total number of records skipped by the consumer by reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let messages_handled = IntCounterVec::new(
            Opts::new(
                "kafka_relay_messages_handled_total",
                "Total number of callback invocations by disposition",
            ),
            &["disposition"],
        )
        .expect("metric creation should succeed");

        let sequences_gapped = IntCounter::new(
            "kafka_relay_sequences_gapped_total",
            "Total number of sequences skipped after the gap hold timeout",
        )
        .expect("metric creation should succeed");

        let last_committed = IntGauge::new(
            "kafka_relay_last_committed_sequence",
            "Highest contiguously committed sequence",
        )
        .expect("metric creation should succeed");

        let commit_errors = IntCounter::new(
            "kafka_relay_commit_errors_total",
            "Total number of failed offset commits",
        )
        .expect("metric creation should succeed");

        let broker_retries = IntCounterVec::new(
            Opts::new(
                "kafka_relay_broker_retries_total",
                "Total number of retries after broker-unavailable failures by operation",
            ),
            &["operation"],
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(messages_sent.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_acked.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_failed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(batches.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(records_received.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(records_skipped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_handled.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(sequences_gapped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(last_committed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(commit_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(broker_retries.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            messages_sent,
            messages_acked,
            messages_failed,
            in_flight,
            batches,
            records_received,
            records_skipped,
            messages_handled,
            sequences_gapped,
            last_committed,
            commit_errors,
            broker_retries,
        }
    }

    /// Record a message handed to the broker.
    pub fn record_sent(&self) {
        self.messages_sent.inc();
        self.in_flight.inc();
    }

    /// Record a broker acknowledgement for a submitted message.
    pub fn record_acked(&self) {
        self.messages_acked.inc();
        self.in_flight.dec();
    }

    /// Record a delivery failure. `submitted` is false for messages that
    /// never reached the broker.
    pub fn record_failed(&self, submitted: bool) {
        self.messages_failed.inc();
        if submitted {
            self.in_flight.dec();
        }
    }

    /// Record a finished batch.
    pub fn record_batch(&self, result: &str) {
        self.batches.with_label_values(&[result]).inc();
    }

    /// Record a record received from the subscription.
    pub fn record_received(&self) {
        self.records_received.inc();
    }

    /// Record a skipped record.
    pub fn record_skipped(&self, reason: &str) {
        self.records_skipped.with_label_values(&[reason]).inc();
    }

    /// Record a callback invocation.
    pub fn record_handled(&self, disposition: &str) {
        self.messages_handled.with_label_values(&[disposition]).inc();
    }

    /// Record sequences skipped past a gap.
    pub fn record_gap(&self, skipped: u64) {
        self.sequences_gapped.inc_by(skipped);
    }

    /// Set the committed sequence.
    pub fn set_last_committed(&self, sequence: u64) {
        self.last_committed
            .set(i64::try_from(sequence).unwrap_or(i64::MAX));
    }

    /// Record a failed offset commit.
    pub fn record_commit_error(&self) {
        self.commit_errors.inc();
    }

    /// Record a retry of `operation`.
    pub fn record_retry(&self, operation: &str) {
        self.broker_retries.with_label_values(&[operation]).inc();
    }

    /// Snapshot of the delivery accounting.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_sent: self.messages_sent.get(),
            total_acked: self.messages_acked.get(),
            total_failed: self.messages_failed.get(),
            last_committed: u64::try_from(self.last_committed.get()).unwrap_or(0),
        }
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
