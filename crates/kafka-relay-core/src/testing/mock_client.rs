//! Scriptable broker client for tests.
//!
//! A [`MockBrokerClient`] records every call and lets a test decide, per
//! sequence, whether a publish is acknowledged, failed or held until
//! released. Records for the subscription side are injected with
//! [`deliver_sequence`](MockBrokerClient::deliver_sequence) and
//! [`deliver_raw`](MockBrokerClient::deliver_raw).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;

use crate::broker::{BrokerClient, DeliveryFuture, DeliveryReceipt, ReceivedRecord, RecordStream};
use crate::error::{RelayError, Result};
use crate::message::MessageCodec;

/// A record handed to [`BrokerClient::publish`].
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    /// Sequence decoded with the default codec, if the payload is a relay
    /// message.
    pub sequence: Option<u64>,
}

/// A recorded offset commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCall {
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

type HeldDelivery = (oneshot::Sender<std::result::Result<DeliveryReceipt, String>>, DeliveryReceipt);

#[derive(Default)]
struct MockState {
    published: Vec<PublishedRecord>,
    fail_sequences: HashMap<u64, String>,
    hold_sequences: HashSet<u64>,
    hold_all: bool,
    held: HashMap<u64, HeldDelivery>,
    ack_delay: Option<Duration>,
    connect_failures: u32,
    connect_attempts: u32,
    unavailable: bool,
    publish_budget: Option<usize>,
    fail_commits: bool,
    commits: Vec<CommitCall>,
    subscription: Option<mpsc::UnboundedSender<Result<ReceivedRecord>>>,
    backlog: Vec<ReceivedRecord>,
    next_offset: i64,
    loopback: bool,
    closed: bool,
}

/// Broker client whose behaviour is scripted by the test.
pub struct MockBrokerClient {
    state: Mutex<MockState>,
    codec: MessageCodec,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    published_count: watch::Sender<usize>,
}

impl MockBrokerClient {
    /// Create a client that acknowledges everything immediately.
    #[must_use]
    pub fn new() -> Self {
        let (published_count, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockState::default()),
            codec: MessageCodec::default(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            published_count,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail delivery of the given sequences.
    pub fn fail_sequences(&self, sequences: impl IntoIterator<Item = u64>) {
        let mut state = self.state();
        for sequence in sequences {
            state
                .fail_sequences
                .insert(sequence, format!("injected failure for sequence {sequence}"));
        }
    }

    /// Hold delivery of the given sequences until released.
    pub fn hold_sequences(&self, sequences: impl IntoIterator<Item = u64>) {
        self.state().hold_sequences.extend(sequences);
    }

    /// Hold every delivery until released.
    pub fn hold_all(&self) {
        self.state().hold_all = true;
    }

    /// Acknowledge a held sequence. Returns false if it was not held.
    pub fn release(&self, sequence: u64) -> bool {
        let held = self.state().held.remove(&sequence);
        match held {
            Some((tx, receipt)) => {
                let _ = tx.send(Ok(receipt));
                true
            }
            None => false,
        }
    }

    /// Acknowledge every held sequence and stop holding new ones.
    pub fn release_all(&self) {
        let held: Vec<HeldDelivery> = {
            let mut state = self.state();
            state.hold_all = false;
            state.hold_sequences.clear();
            state.held.drain().map(|(_, held)| held).collect()
        };
        for (tx, receipt) in held {
            let _ = tx.send(Ok(receipt));
        }
    }

    /// Sequences currently held.
    #[must_use]
    pub fn held_sequences(&self) -> Vec<u64> {
        let mut held: Vec<u64> = self.state().held.keys().copied().collect();
        held.sort_unstable();
        held
    }

    /// Delay every acknowledgement by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state().ack_delay = Some(delay);
    }

    /// Fail the next `count` connect attempts with `BrokerUnavailable`.
    pub fn connect_failures(&self, count: u32) {
        self.state().connect_failures = count;
    }

    /// Reject every request with `BrokerUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Accept `count` more publishes, then reject with `BrokerUnavailable`.
    pub fn fail_publish_after(&self, count: usize) {
        self.state().publish_budget = Some(count);
    }

    /// Reject offset commits while set.
    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }

    /// Feed every published record into the subscription.
    pub fn set_loopback(&self, loopback: bool) {
        self.state().loopback = loopback;
    }

    /// Inject a raw record into the subscription.
    pub fn deliver_raw(&self, payload: impl Into<Bytes>) {
        let mut state = self.state();
        Self::enqueue(&mut state, payload.into());
    }

    /// Inject a default relay message with `sequence`.
    pub fn deliver_sequence(&self, sequence: u64) {
        self.deliver_raw(self.codec.encode(sequence, Utc::now(), ""));
    }

    /// End the subscription stream.
    pub fn close_subscription(&self) {
        self.state().subscription = None;
    }

    /// Yield a `BrokerUnavailable` error on the open subscription.
    pub fn fail_subscription(&self, message: &str) {
        if let Some(tx) = &self.state().subscription {
            let _ = tx.unbounded_send(Err(RelayError::unavailable(message)));
        }
    }

    fn enqueue(state: &mut MockState, payload: Bytes) {
        let record = ReceivedRecord {
            payload,
            offset: state.next_offset,
        };
        state.next_offset += 1;

        let record = match &state.subscription {
            Some(tx) => match tx.unbounded_send(Ok(record)) {
                Ok(()) => return,
                Err(e) => match e.into_inner() {
                    Ok(record) => record,
                    Err(_) => return,
                },
            },
            None => record,
        };
        state.backlog.push(record);
    }

    /// Every published record, in submission order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state().published.clone()
    }

    /// Sequences of published records, in submission order.
    #[must_use]
    pub fn published_sequences(&self) -> Vec<u64> {
        self.state()
            .published
            .iter()
            .filter_map(|r| r.sequence)
            .collect()
    }

    /// Wait until at least `count` records have been published.
    pub async fn wait_for_published(&self, count: usize) {
        let mut rx = self.published_count.subscribe();
        let _ = rx.wait_for(|published| *published >= count).await;
    }

    /// Deliveries handed out but not yet resolved.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously unresolved deliveries.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn commits(&self) -> Vec<CommitCall> {
        self.state().commits.clone()
    }

    /// Offset of the most recent commit by `group_id`.
    #[must_use]
    pub fn last_commit(&self, group_id: &str) -> Option<i64> {
        self.state()
            .commits
            .iter()
            .rev()
            .find(|c| c.group_id == group_id)
            .map(|c| c.offset)
    }

    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Default for MockBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state();
        state.connect_attempts += 1;
        state.closed = false;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RelayError::unavailable("injected connect failure"));
        }
        if state.unavailable {
            return Err(RelayError::unavailable("mock broker is offline"));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<DeliveryFuture> {
        let mut state = self.state();
        if state.unavailable {
            return Err(RelayError::unavailable("mock broker is offline"));
        }
        if let Some(budget) = state.publish_budget.as_mut() {
            if *budget == 0 {
                return Err(RelayError::unavailable("connection lost"));
            }
            *budget -= 1;
        }

        let sequence = self.codec.decode(&payload).ok().map(|m| m.sequence());
        let offset = state.published.len() as i64;
        state.published.push(PublishedRecord {
            topic: topic.to_string(),
            key,
            payload: payload.clone(),
            sequence,
        });
        if state.loopback {
            Self::enqueue(&mut state, payload);
        }

        let receipt = DeliveryReceipt {
            partition: 0,
            offset,
        };
        let hold_key = sequence.unwrap_or(offset as u64);

        let delivery: DeliveryFuture = if let Some(reason) =
            sequence.and_then(|s| state.fail_sequences.get(&s).cloned())
        {
            futures::future::ready(Err(reason)).boxed()
        } else if state.hold_all || state.hold_sequences.contains(&hold_key) {
            let (tx, rx) = oneshot::channel();
            state.held.insert(hold_key, (tx, receipt));
            async move {
                rx.await
                    .unwrap_or_else(|_| Err("delivery abandoned".to_string()))
            }
            .boxed()
        } else if let Some(delay) = state.ack_delay {
            async move {
                tokio::time::sleep(delay).await;
                Ok(receipt)
            }
            .boxed()
        } else {
            futures::future::ready(Ok(receipt)).boxed()
        };

        let published = state.published.len();
        drop(state);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.published_count.send_replace(published);

        let in_flight = Arc::clone(&self.in_flight);
        Ok(async move {
            let result = delivery.await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed())
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _partition: i32,
        _group_id: &str,
    ) -> Result<RecordStream> {
        let mut state = self.state();
        if state.unavailable {
            return Err(RelayError::unavailable("mock broker is offline"));
        }

        let (tx, rx) = mpsc::unbounded();
        for record in state.backlog.drain(..) {
            let _ = tx.unbounded_send(Ok(record));
        }
        state.subscription = Some(tx);

        Ok(rx.boxed())
    }

    async fn commit(&self, group_id: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut state = self.state();
        if state.unavailable || state.fail_commits {
            return Err(RelayError::unavailable("injected commit failure"));
        }
        state.commits.push(CommitCall {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscription = None;
    }
}
