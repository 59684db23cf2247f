//! Per-batch delivery accounting.
//!
//! A [`DeliveryTracker`] is created for every batch. All of the batch's
//! sequences start out pending; each broker outcome moves one sequence to
//! acked or failed. Waiters hold a [`BatchHandle`] and are woken by outcome
//! arrival through a `watch` channel.
//!
//! Outcomes must be applied by a single writer (the producer's delivery
//! worker). The tracker keeps accepting outcomes after a waiter has given up,
//! so late acknowledgements are still reflected in [`BatchHandle::snapshot`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::message::{Batch, BatchId};

/// Result of delivering one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The broker acknowledged the message.
    Acked(u64),
    /// The broker rejected the message, or it could not be submitted.
    Failed(u64, String),
}

impl DeliveryOutcome {
    /// Sequence this outcome refers to.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Acked(sequence) | Self::Failed(sequence, _) => *sequence,
        }
    }
}

/// Mutable accounting for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerState {
    pending: BTreeSet<u64>,
    acked: usize,
    failed: BTreeMap<u64, String>,
}

impl TrackerState {
    /// Sequences still waiting for an outcome.
    #[must_use]
    pub fn pending(&self) -> &BTreeSet<u64> {
        &self.pending
    }

    /// Number of acknowledged sequences.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.acked
    }

    /// Failed sequences with their reasons.
    #[must_use]
    pub fn failed(&self) -> &BTreeMap<u64, String> {
        &self.failed
    }

    /// No sequence is pending any more.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Tracks outcomes for one batch.
#[derive(Debug)]
pub struct DeliveryTracker {
    batch_id: BatchId,
    total: usize,
    state: watch::Sender<TrackerState>,
}

impl DeliveryTracker {
    /// Register every message of `batch` as pending.
    #[must_use]
    pub fn start(batch: &Batch) -> Self {
        let state = TrackerState {
            pending: batch.sequences().collect(),
            ..TrackerState::default()
        };
        let (tx, _) = watch::channel(state);

        Self {
            batch_id: batch.id(),
            total: batch.total(),
            state: tx,
        }
    }

    #[must_use]
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// A handle that can await this batch.
    #[must_use]
    pub fn handle(&self) -> BatchHandle {
        BatchHandle {
            batch_id: self.batch_id,
            total: self.total,
            state: self.state.subscribe(),
        }
    }

    /// Apply one outcome, waking every waiter.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UnknownSequence`] if the sequence is not
    /// pending, which happens on duplicate broker callbacks. The tracker is
    /// left unchanged in that case.
    pub fn on_outcome(&self, outcome: DeliveryOutcome) -> Result<(), TrackerError> {
        let sequence = outcome.sequence();
        let mut known = false;

        self.state.send_if_modified(|state| {
            if !state.pending.remove(&sequence) {
                return false;
            }
            known = true;
            match outcome {
                DeliveryOutcome::Acked(_) => state.acked += 1,
                DeliveryOutcome::Failed(_, reason) => {
                    state.failed.insert(sequence, reason);
                }
            }
            true
        });

        if known {
            Ok(())
        } else {
            Err(TrackerError::UnknownSequence(sequence))
        }
    }

    /// Number of acknowledged messages so far.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.state.borrow().acked
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }
}

/// How a wait on a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Completed,
    TimedOut,
    Cancelled,
}

/// Awaitable view of a batch.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    batch_id: BatchId,
    total: usize,
    state: watch::Receiver<TrackerState>,
}

impl BatchHandle {
    #[must_use]
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Current accounting, including outcomes that arrived after a wait
    /// returned.
    #[must_use]
    pub fn snapshot(&self) -> TrackerState {
        self.state.borrow().clone()
    }

    /// Suspend until every sequence has an outcome, `deadline` elapses, or
    /// `cancel` fires.
    ///
    /// On timeout the unresolved sequences are reported in
    /// [`BatchResult::pending_sequences`]; on cancellation in
    /// [`BatchResult::cancelled_sequences`]. A tracker that is dropped while
    /// sequences are pending counts as cancelled.
    pub async fn wait(&self, deadline: Option<Duration>, cancel: &CancellationToken) -> BatchResult {
        let mut rx = self.state.clone();

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let end = tokio::select! {
            biased;
            done = rx.wait_for(TrackerState::is_terminal) => {
                if done.is_ok() { WaitEnd::Completed } else { WaitEnd::Cancelled }
            }
            () = cancel.cancelled() => WaitEnd::Cancelled,
            () = expired => WaitEnd::TimedOut,
        };

        BatchResult::from_state(self.batch_id, self.total, &self.snapshot(), end)
    }
}

/// Final accounting of a batch as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_id: BatchId,
    /// Messages in the batch.
    pub total: usize,
    pub acked_count: usize,
    /// Failed sequences in ascending order.
    pub failed_sequences: Vec<u64>,
    /// Failure reason per failed sequence.
    pub failures: BTreeMap<u64, String>,
    /// Sequences still unresolved when the deadline elapsed.
    pub pending_sequences: Vec<u64>,
    /// Sequences still unresolved when the batch was cancelled.
    pub cancelled_sequences: Vec<u64>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl BatchResult {
    fn from_state(batch_id: BatchId, total: usize, state: &TrackerState, end: WaitEnd) -> Self {
        let unresolved: Vec<u64> = state.pending.iter().copied().collect();

        // A wait can lose the race with the final outcome; trust the state.
        let end = if unresolved.is_empty() {
            WaitEnd::Completed
        } else {
            end
        };

        let (pending_sequences, cancelled_sequences) = match end {
            WaitEnd::Completed => (Vec::new(), Vec::new()),
            WaitEnd::TimedOut => (unresolved, Vec::new()),
            WaitEnd::Cancelled => (Vec::new(), unresolved),
        };

        Self {
            batch_id,
            total,
            acked_count: state.acked,
            failed_sequences: state.failed.keys().copied().collect(),
            failures: state.failed.clone(),
            pending_sequences,
            cancelled_sequences,
            timed_out: end == WaitEnd::TimedOut,
            cancelled: end == WaitEnd::Cancelled,
        }
    }

    /// Every message reached a terminal outcome.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.timed_out && !self.cancelled
    }

    /// Every message was acknowledged.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.acked_count == self.total
    }
}
