//! Subscription consumer with deduplication and contiguous commits.
//!
//! [`RelayConsumer::subscribe`] opens a broker subscription and spawns one
//! receive loop. For every record the loop decodes the payload, drops
//! malformed records and recent duplicates, invokes the [`MessageHandler`]
//! and commits progress through the [`ConsumerSession`].
//!
//! The loop ends when it is cancelled, when the broker closes the
//! subscription or when the stream yields an error. The last two are
//! reported through [`RelayConsumer::watch_failure`] and the session is
//! parked so that the next [`subscribe`](RelayConsumer::subscribe) to the
//! same partition resumes from it.

pub mod session;

pub use session::{Admission, CommitAdvance, ConsumerSession, SessionSnapshot};

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerClient, ReceivedRecord, RecordStream};
use crate::config::ConsumerConfig;
use crate::error::{RelayError, Result};
use crate::message::{Message, MessageCodec};
use crate::metrics::RelayMetrics;

/// What the callback decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; the sequence may advance the commit point.
    Ack,
    /// Not processed; the sequence never advances the commit point.
    Reject,
}

/// User callback invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: &Message) -> Disposition;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Disposition + Send + Sync,
{
    async fn on_message(&self, message: &Message) -> Disposition {
        self(message)
    }
}

/// Consumes one topic partition on behalf of a consumer group.
pub struct RelayConsumer {
    client: Arc<dyn BrokerClient>,
    codec: MessageCodec,
    config: ConsumerConfig,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    failure: Arc<watch::Sender<Option<RelayError>>>,
    parked: Arc<std::sync::Mutex<Option<ConsumerSession>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConsumer {
    /// Create a consumer. Nothing is read until [`subscribe`](Self::subscribe).
    pub fn new(
        client: Arc<dyn BrokerClient>,
        codec: MessageCodec,
        config: ConsumerConfig,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (failure, _) = watch::channel(None);
        Self {
            client,
            codec,
            config,
            metrics,
            cancel,
            snapshot: Arc::new(snapshot),
            failure: Arc::new(failure),
            parked: Arc::new(std::sync::Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Open the subscription and start the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Subscription`] if this consumer is already
    /// subscribed, [`RelayError::NotRunning`] after [`stop`](Self::stop), or
    /// the broker's error if the subscription cannot be opened.
    #[instrument(skip(self, handler))]
    pub async fn subscribe(
        &self,
        topic: &str,
        partition: i32,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::NotRunning);
        }

        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            if !previous.is_finished() && self.failure.borrow().is_none() {
                *task = Some(previous);
                return Err(RelayError::Subscription {
                    topic: topic.to_string(),
                    partition,
                    message: "consumer is already subscribed".to_string(),
                });
            }
            // The loop has reported its exit and is parking the session.
            let _ = previous.await;
        }

        let stream = self.client.subscribe(topic, partition, group_id).await?;

        let session = match self.take_parked(topic, partition, group_id) {
            Some(session) => {
                info!(
                    last_committed = session.last_committed(),
                    "resuming consumer session"
                );
                session
            }
            None => ConsumerSession::new(
                group_id,
                topic,
                partition,
                self.config.dedup_window,
                self.config.gap_hold_timeout(),
            ),
        };
        self.snapshot.send_replace(session.snapshot());
        self.failure.send_replace(None);

        let receive_loop = ReceiveLoop {
            client: Arc::clone(&self.client),
            codec: self.codec.clone(),
            metrics: Arc::clone(&self.metrics),
            handler,
            session,
            snapshot: Arc::clone(&self.snapshot),
        };

        let gap_check = self.config.gap_check_interval();
        let cancel = self.cancel.clone();
        let failure = Arc::clone(&self.failure);
        let parked = Arc::clone(&self.parked);

        *task = Some(tokio::spawn(async move {
            let (session, exit) = receive_loop.run(stream, gap_check, cancel).await;
            *parked.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
            if let Some(err) = exit {
                failure.send_replace(Some(err));
            }
        }));

        info!("consumer subscribed");
        Ok(())
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn session(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified whenever the session changes.
    #[must_use]
    pub fn watch_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Why the receive loop last ended without being stopped, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<RelayError> {
        self.failure.borrow().clone()
    }

    /// Receiver that is notified when the receive loop ends on its own.
    /// Holds `None` while the loop runs.
    #[must_use]
    pub fn watch_failure(&self) -> watch::Receiver<Option<RelayError>> {
        self.failure.subscribe()
    }

    fn take_parked(&self, topic: &str, partition: i32, group_id: &str) -> Option<ConsumerSession> {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.take().filter(|session| {
            session.topic() == topic
                && session.partition() == partition
                && session.group_id() == group_id
        })
    }

    /// Whether the receive loop is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
            && self.failure.borrow().is_none()
    }

    /// Cancel the receive loop, waiting up to `grace` for it to finish.
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();

        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "receive loop did not stop within grace period, aborting"
            );
            task.abort();
        }
        debug!("consumer stopped");
    }
}

/// State owned by the receive loop task.
struct ReceiveLoop {
    client: Arc<dyn BrokerClient>,
    codec: MessageCodec,
    metrics: Arc<RelayMetrics>,
    handler: Arc<dyn MessageHandler>,
    session: ConsumerSession,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
}

impl ReceiveLoop {
    /// Run until cancelled or the subscription ends. Returns the session and,
    /// unless cancelled, the reason the loop stopped.
    async fn run(
        mut self,
        mut stream: RecordStream,
        gap_check: Duration,
        cancel: CancellationToken,
    ) -> (ConsumerSession, Option<RelayError>) {
        let mut ticker = tokio::time::interval(gap_check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("receive loop cancelled");
                    break None;
                }
                item = stream.next() => match item {
                    Some(Ok(record)) => self.handle_record(record).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "subscription failed, receive loop stopping");
                        break Some(e);
                    }
                    None => {
                        warn!("subscription closed by broker, receive loop stopping");
                        break Some(RelayError::Subscription {
                            topic: self.session.topic().to_string(),
                            partition: self.session.partition(),
                            message: "subscription closed by broker".to_string(),
                        });
                    }
                },
                _ = ticker.tick() => {
                    if let Some(advance) = self.session.poll_gaps(Instant::now()) {
                        self.commit(advance).await;
                        self.publish_snapshot();
                    }
                }
            }
        };

        (self.session, exit)
    }

    async fn handle_record(&mut self, record: ReceivedRecord) {
        self.metrics.record_received();

        let message = match self.codec.decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_skipped("malformed");
                warn!(offset = record.offset, error = %e, "skipping malformed record");
                return;
            }
        };
        let sequence = message.sequence();

        if self.session.admit(sequence) == Admission::Duplicate {
            self.metrics.record_skipped("duplicate");
            info!(sequence, offset = record.offset, "duplicate sequence, not redelivered");
            return;
        }

        match self.handler.on_message(&message).await {
            Disposition::Ack => {
                self.metrics.record_handled("ack");
                if let Some(advance) =
                    self.session.accept(sequence, record.offset, Instant::now())
                {
                    self.commit(advance).await;
                }
            }
            Disposition::Reject => {
                self.metrics.record_handled("reject");
                debug!(sequence, "message rejected by handler");
            }
        }

        self.publish_snapshot();
    }

    async fn commit(&self, advance: CommitAdvance) {
        for range in &advance.skipped {
            let gap = RelayError::SequenceGap {
                first: *range.start(),
                last: *range.end(),
            };
            warn!(error = %gap, "gap hold timeout elapsed");
        }
        if !advance.skipped.is_empty() {
            self.metrics.record_gap(advance.skipped_count());
        }

        self.metrics.set_last_committed(advance.last_committed);

        if let Err(e) = self
            .client
            .commit(
                self.session.group_id(),
                self.session.topic(),
                self.session.partition(),
                advance.offset,
            )
            .await
        {
            self.metrics.record_commit_error();
            warn!(
                offset = advance.offset,
                last_committed = advance.last_committed,
                error = %e,
                "offset commit failed"
            );
            return;
        }

        debug!(
            previous = advance.previous,
            last_committed = advance.last_committed,
            offset = advance.offset,
            "progress committed"
        );
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.session.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBrokerClient, RecordingHandler};

    fn consumer_with(client: Arc<MockBrokerClient>, config: ConsumerConfig) -> RelayConsumer {
        RelayConsumer::new(
            client,
            MessageCodec::default(),
            config,
            Arc::new(RelayMetrics::new()),
            CancellationToken::new(),
        )
    }

    async fn wait_session(
        consumer: &RelayConsumer,
        condition: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = consumer.watch_session();
        let snapshot = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(condition))
            .await
            .expect("session should reach expected state")
            .expect("session channel open")
            .clone();
        snapshot
    }

    async fn wait_committed(consumer: &RelayConsumer, sequence: u64) -> SessionSnapshot {
        wait_session(consumer, |s| s.last_committed >= sequence).await
    }

    #[tokio::test]
    async fn test_duplicate_delivered_once() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler = Arc::new(RecordingHandler::new());

        consumer
            .subscribe("t", 0, "g", handler.clone())
            .await
            .unwrap();

        for sequence in [1, 2, 5, 5, 3, 4] {
            client.deliver_sequence(sequence);
        }

        let snapshot = wait_committed(&consumer, 5).await;
        assert_eq!(snapshot.last_committed, 5);
        assert_eq!(handler.sequences(), vec![1, 2, 5, 3, 4]);
        assert_eq!(client.last_commit("g"), Some(6));

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_commit_waits_for_contiguous_run() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler = Arc::new(RecordingHandler::new());
        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();

        client.deliver_sequence(1);
        client.deliver_sequence(3);
        let snapshot = wait_session(&consumer, |s| !s.buffered.is_empty()).await;
        assert_eq!(snapshot.last_committed, 1);
        assert_eq!(snapshot.buffered, vec![3]);

        client.deliver_sequence(2);
        let snapshot = wait_committed(&consumer, 3).await;
        assert_eq!(snapshot.committed_offset, Some(3));

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_malformed_and_rejected_do_not_advance() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler = Arc::new(RecordingHandler::rejecting([2]));
        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();

        client.deliver_raw(&b"Hello, world!"[..]);
        client.deliver_sequence(1);
        client.deliver_sequence(2);
        client.deliver_sequence(3);

        handler.wait_for_count(3).await;
        let snapshot = wait_session(&consumer, |s| !s.buffered.is_empty()).await;
        assert_eq!(snapshot.last_committed, 1);
        assert_eq!(snapshot.buffered, vec![3]);
        assert_eq!(handler.sequences(), vec![1, 2, 3]);
        assert_eq!(handler.acked(), vec![1, 3]);

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_gap_is_skipped_after_hold() {
        let client = Arc::new(MockBrokerClient::new());
        let config = ConsumerConfig {
            gap_hold_timeout_ms: 1_000,
            gap_check_interval_ms: 100,
            ..ConsumerConfig::default()
        };
        let metrics = Arc::new(RelayMetrics::new());
        let consumer = RelayConsumer::new(
            client.clone(),
            MessageCodec::default(),
            config,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        consumer
            .subscribe("t", 0, "g", Arc::new(RecordingHandler::new()))
            .await
            .unwrap();

        client.deliver_sequence(1);
        client.deliver_sequence(4);

        let started = Instant::now();
        let snapshot = wait_committed(&consumer, 4).await;
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(snapshot.last_committed, 4);
        assert_eq!(metrics.sequences_gapped.get(), 2);

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_second_subscribe_is_rejected() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler: Arc<dyn MessageHandler> = Arc::new(|_: &Message| Disposition::Ack);

        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();
        assert!(consumer.is_running().await);

        let err = consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap_err();
        assert!(matches!(err, RelayError::Subscription { .. }));

        consumer.stop(Duration::from_secs(1)).await;
        assert!(!consumer.is_running().await);
        assert!(matches!(
            consumer.subscribe("t", 0, "g", handler).await,
            Err(RelayError::NotRunning)
        ));
    }

    async fn wait_failure(consumer: &RelayConsumer) -> RelayError {
        let mut rx = consumer.watch_failure();
        let failure = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_some))
            .await
            .expect("receive loop should report its exit")
            .expect("failure channel open")
            .clone();
        failure.expect("failure is set")
    }

    #[tokio::test]
    async fn test_closed_subscription_is_reported_and_resumable() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler = Arc::new(RecordingHandler::new());
        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();

        client.deliver_sequence(1);
        wait_committed(&consumer, 1).await;

        client.close_subscription();
        let err = wait_failure(&consumer).await;
        assert!(matches!(err, RelayError::Subscription { partition: 0, .. }));
        assert!(!consumer.is_running().await);

        // Redelivery of 1 lands in the backlog along with 2.
        client.deliver_sequence(1);
        client.deliver_sequence(2);
        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();
        assert!(consumer.failure().is_none());

        let snapshot = wait_committed(&consumer, 2).await;
        assert_eq!(snapshot.last_committed, 2);
        assert_eq!(handler.sequences(), vec![1, 2]);

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stream_error_stops_receive_loop() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        let handler = Arc::new(RecordingHandler::new());
        consumer.subscribe("t", 0, "g", handler.clone()).await.unwrap();

        client.fail_subscription("connection reset");
        let err = wait_failure(&consumer).await;
        assert!(matches!(err, RelayError::BrokerUnavailable { .. }));
        assert!(err.to_string().contains("connection reset"));

        client.deliver_sequence(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.sequences().is_empty());
        assert!(!consumer.is_running().await);

        consumer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_is_not_reported_as_failure() {
        let client = Arc::new(MockBrokerClient::new());
        let consumer = consumer_with(client.clone(), ConsumerConfig::default());
        consumer
            .subscribe("t", 0, "g", Arc::new(RecordingHandler::new()))
            .await
            .unwrap();

        consumer.stop(Duration::from_secs(1)).await;
        client.close_subscription();
        assert!(consumer.failure().is_none());
    }

    #[tokio::test]
    async fn test_commit_failure_is_counted() {
        let client = Arc::new(MockBrokerClient::new());
        client.fail_commits(true);
        let metrics = Arc::new(RelayMetrics::new());
        let consumer = RelayConsumer::new(
            client.clone(),
            MessageCodec::default(),
            ConsumerConfig::default(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        consumer
            .subscribe("t", 0, "g", Arc::new(RecordingHandler::new()))
            .await
            .unwrap();

        client.deliver_sequence(1);
        wait_committed(&consumer, 1).await;

        assert_eq!(metrics.commit_errors.get(), 1);
        assert_eq!(client.last_commit("g"), None);

        consumer.stop(Duration::from_secs(1)).await;
    }
}
