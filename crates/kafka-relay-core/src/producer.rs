//! Batch producer with delivery tracking and backpressure.
//!
//! [`RelayProducer::send_batch`] turns a logical "send N messages" request
//! into individually sequenced records, submits them in increasing sequence
//! order and waits for the batch's [`DeliveryTracker`] to reach a terminal
//! state.
//!
//! Broker outcomes are applied by one delivery worker task per producer, so
//! every tracker has a single writer. Submissions and the worker are linked
//! by an unbounded channel; the number of unresolved sends is bounded
//! separately by the backpressure window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerClient, DeliveryFuture};
use crate::config::ProducerConfig;
use crate::error::{RelayError, Result};
use crate::message::{Batch, Message, MessageCodec};
use crate::metrics::RelayMetrics;
use crate::tracker::{BatchResult, DeliveryOutcome, DeliveryTracker};

/// A send handed to the delivery worker.
struct InFlight {
    sequence: u64,
    tracker: Arc<DeliveryTracker>,
    delivery: DeliveryFuture,
    /// Whether the record reached the broker. Unsubmitted records carry a
    /// ready failure.
    submitted: bool,
    /// Backpressure slot, released once the outcome is recorded.
    permit: Option<OwnedSemaphorePermit>,
}

/// A resolved send, ready to be applied to its tracker.
struct Resolved {
    sequence: u64,
    tracker: Arc<DeliveryTracker>,
    outcome: DeliveryOutcome,
    submitted: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl InFlight {
    fn resolve(self) -> BoxFuture<'static, Resolved> {
        async move {
            let outcome = match self.delivery.await {
                Ok(_) => DeliveryOutcome::Acked(self.sequence),
                Err(reason) => DeliveryOutcome::Failed(self.sequence, reason),
            };
            Resolved {
                sequence: self.sequence,
                tracker: self.tracker,
                outcome,
                submitted: self.submitted,
                permit: self.permit,
            }
        }
        .boxed()
    }
}

/// Why submission stopped before every message was handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

/// Produces sequenced batches through a [`BrokerClient`].
pub struct RelayProducer {
    client: Arc<dyn BrokerClient>,
    codec: MessageCodec,
    config: ProducerConfig,
    metrics: Arc<RelayMetrics>,
    window: Option<Arc<Semaphore>>,
    /// Next sequence of this producer session. Holding the lock serializes
    /// submission so sequences reach the broker in increasing order. A batch
    /// reserves its range before the first publish, so an abandoned send
    /// never hands its sequences out again.
    next_sequence: Mutex<u64>,
    worker_tx: mpsc::UnboundedSender<InFlight>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl RelayProducer {
    /// Create a producer and spawn its delivery worker.
    ///
    /// `cancel` aborts suspended submissions and waits. Must be called from
    /// within a tokio runtime.
    pub fn new(
        client: Arc<dyn BrokerClient>,
        codec: MessageCodec,
        config: ProducerConfig,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let drain = CancellationToken::new();

        let worker = tokio::spawn(run_delivery_worker(
            worker_rx,
            Arc::clone(&metrics),
            config.progress_log_interval,
            drain.clone(),
        ));

        let window = config
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit)));

        debug!(
            topic = %config.topic,
            max_in_flight = ?config.max_in_flight,
            "producer created"
        );

        Self {
            client,
            codec,
            config,
            metrics,
            window,
            next_sequence: Mutex::new(1),
            worker_tx,
            worker: Mutex::new(Some(worker)),
            cancel,
            drain,
        }
    }

    /// The sequence the next message will carry.
    pub async fn next_sequence(&self) -> u64 {
        *self.next_sequence.lock().await
    }

    /// Send `count` default messages to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BrokerUnavailable`] if the first message could not
    /// be handed to the broker (no sequences are consumed), or
    /// [`RelayError::NotRunning`] after shutdown. Per-message failures are
    /// reported in the [`BatchResult`].
    #[instrument(skip(self), fields(topic = %topic))]
    pub async fn send_batch(&self, count: usize, topic: &str) -> Result<BatchResult> {
        self.send(topic, vec![String::new(); count]).await
    }

    /// Send one message per entry of `texts`, carrying that text.
    ///
    /// # Errors
    ///
    /// Same as [`send_batch`](Self::send_batch).
    #[instrument(skip(self, texts), fields(topic = %topic, count = texts.len()))]
    pub async fn send_payloads(&self, topic: &str, texts: Vec<String>) -> Result<BatchResult> {
        self.send(topic, texts).await
    }

    async fn send(&self, topic: &str, texts: Vec<String>) -> Result<BatchResult> {
        if self.cancel.is_cancelled() || self.drain.is_cancelled() {
            return Err(RelayError::NotRunning);
        }

        let deadline = self.config.batch_deadline().map(|d| Instant::now() + d);
        let mut next_sequence = self.next_sequence.lock().await;
        let first = *next_sequence;

        let produced_at = Utc::now();
        let batch = Batch::new(
            (first..)
                .zip(texts)
                .map(|(sequence, text)| Message::new(sequence, produced_at, text))
                .collect(),
        );
        *next_sequence = first + batch.total() as u64;
        let tracker = Arc::new(DeliveryTracker::start(&batch));
        let handle = tracker.handle();

        debug!(
            batch_id = %batch.id(),
            first_sequence = first,
            total = batch.total(),
            "submitting batch"
        );

        let mut submitted = 0usize;
        let mut interrupt = None;

        for (index, message) in batch.messages().iter().enumerate() {
            let permit = match self.acquire_slot(deadline).await {
                Ok(permit) => permit,
                Err(reason) => {
                    interrupt = Some(reason);
                    break;
                }
            };

            if self.worker_tx.is_closed() {
                interrupt = Some(Interrupt::Cancelled);
                break;
            }

            let payload = self.codec.encode_message(message);
            let published = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                result = self.client.publish(topic, None, payload) => result,
            };

            match published {
                Ok(delivery) => {
                    self.metrics.record_sent();
                    self.dispatch(InFlight {
                        sequence: message.sequence(),
                        tracker: Arc::clone(&tracker),
                        delivery,
                        submitted: true,
                        permit,
                    });
                    submitted += 1;
                }
                Err(e) if submitted == 0 => {
                    *next_sequence = first;
                    warn!(
                        batch_id = %batch.id(),
                        error = %e,
                        "broker rejected first message, batch not started"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        batch_id = %batch.id(),
                        sequence = message.sequence(),
                        error = %e,
                        "submission failed mid-batch, failing remaining messages"
                    );
                    let reason = e.to_string();
                    for rest in &batch.messages()[index..] {
                        self.dispatch(InFlight {
                            sequence: rest.sequence(),
                            tracker: Arc::clone(&tracker),
                            delivery: futures::future::ready(Err(reason.clone())).boxed(),
                            submitted: false,
                            permit: None,
                        });
                    }
                    break;
                }
            }
        }

        drop(next_sequence);

        let remaining = match interrupt {
            Some(Interrupt::Deadline) => Some(Duration::ZERO),
            _ => deadline.map(|d| d.saturating_duration_since(Instant::now())),
        };
        let result = handle.wait(remaining, &self.cancel).await;

        let label = if result.cancelled {
            "cancelled"
        } else if result.timed_out {
            "timed_out"
        } else {
            "completed"
        };
        self.metrics.record_batch(label);

        info!(
            batch_id = %result.batch_id,
            total = result.total,
            acked = result.acked_count,
            failed = result.failed_sequences.len(),
            pending = result.pending_sequences.len(),
            cancelled = result.cancelled_sequences.len(),
            result = label,
            "batch finished"
        );

        Ok(result)
    }

    /// Wait for a backpressure slot. Returns `Ok(None)` when the window is
    /// unbounded.
    async fn acquire_slot(
        &self,
        deadline: Option<Instant>,
    ) -> std::result::Result<Option<OwnedSemaphorePermit>, Interrupt> {
        let Some(window) = &self.window else {
            return Ok(None);
        };

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            permit = Arc::clone(window).acquire_owned() => {
                permit.map(Some).map_err(|_| Interrupt::Cancelled)
            }
            () = expired => Err(Interrupt::Deadline),
        }
    }

    fn dispatch(&self, item: InFlight) {
        let sequence = item.sequence;
        if self.worker_tx.send(item).is_err() {
            warn!(sequence, "delivery worker stopped, outcome will not be recorded");
        }
    }

    /// Stop accepting sends and let the delivery worker drain in-flight
    /// outcomes for up to `grace`, then abort it.
    pub async fn shutdown(&self, grace: Duration) {
        self.drain.cancel();
        if let Some(window) = &self.window {
            window.close();
        }

        let Some(mut worker) = self.worker.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(grace, &mut worker).await {
            Ok(_) => debug!("delivery worker drained"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "delivery worker did not drain within grace period, aborting"
                );
                worker.abort();
            }
        }
    }
}

/// Apply delivery outcomes until the producer drains or is dropped.
async fn run_delivery_worker(
    mut rx: mpsc::UnboundedReceiver<InFlight>,
    metrics: Arc<RelayMetrics>,
    progress_log_interval: u64,
    drain: CancellationToken,
) {
    let mut in_flight = FuturesUnordered::new();
    let mut acked_total = 0u64;
    let mut draining = false;
    let mut closed = false;

    loop {
        if closed && in_flight.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            Some(resolved) = in_flight.next() => {
                let Resolved { sequence, tracker, outcome, submitted, permit } = resolved;

                match &outcome {
                    DeliveryOutcome::Acked(_) => {
                        metrics.record_acked();
                        acked_total += 1;
                        if progress_log_interval > 0 && acked_total % progress_log_interval == 0 {
                            info!("sent {} messages", acked_total);
                        }
                    }
                    DeliveryOutcome::Failed(_, reason) => {
                        metrics.record_failed(submitted);
                        warn!(sequence, reason = %reason, "message delivery failed");
                    }
                }

                if let Err(e) = tracker.on_outcome(outcome) {
                    warn!(batch_id = %tracker.batch_id(), error = %e, "ignoring delivery outcome");
                }
                drop(permit);
            }
            item = rx.recv(), if !closed => {
                match item {
                    Some(item) => in_flight.push(item.resolve()),
                    None => closed = true,
                }
            }
            () = drain.cancelled(), if !draining => {
                draining = true;
                rx.close();
                debug!(in_flight = in_flight.len(), "delivery worker draining");
            }
            else => break,
        }
    }

    debug!(acked_total, "delivery worker stopped");
}
