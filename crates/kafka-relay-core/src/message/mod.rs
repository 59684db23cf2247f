//! Relay message model and wire codec.
//!
//! - [`Message`] - one immutable relay message
//! - [`Batch`] - an ordered group of messages tracked to a single outcome
//! - [`MessageCodec`] - text wire format shared by producer and consumer

pub mod codec;

pub use codec::{MessageCodec, Validator};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SubsecRound, Utc};

/// A single relay message.
///
/// The timestamp is truncated to millisecond precision on construction so
/// that it survives a round trip through the wire format unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sequence: u64,
    produced_at: DateTime<Utc>,
    payload: String,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(sequence: u64, produced_at: DateTime<Utc>, payload: impl Into<String>) -> Self {
        Self {
            sequence,
            produced_at: produced_at.trunc_subsecs(3),
            payload: payload.into(),
        }
    }

    /// Position of this message within its producer session (1-based).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the producer created the message.
    #[must_use]
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// Free text carried by the message. Empty for default messages.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Opaque identifier of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    /// Allocate a process-unique batch id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// An ordered group of messages submitted together.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    messages: Vec<Message>,
}

impl Batch {
    /// Create a batch with a fresh id.
    ///
    /// Messages are expected in strictly increasing sequence order.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        debug_assert!(messages
            .windows(2)
            .all(|w| w[0].sequence() < w[1].sequence()));
        Self {
            id: BatchId::next(),
            messages,
        }
    }

    #[must_use]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of messages in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Sequences of all messages, in submission order.
    pub fn sequences(&self) -> impl Iterator<Item = u64> + '_ {
        self.messages.iter().map(Message::sequence)
    }
}
