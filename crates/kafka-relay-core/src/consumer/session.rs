//! Consumer-side progress accounting.
//!
//! A [`ConsumerSession`] answers two questions for every decoded record:
//! has this sequence been handed to the callback recently, and how far can
//! the commit point move once the callback accepted it.
//!
//! The commit point (`last_committed`) only advances through gap-free runs of
//! accepted sequences. A gap is held for the configured hold timeout and then
//! skipped; the next gap's hold starts at the moment of the skip.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::time::Instant;

/// Whether a decoded record should reach the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Deliver,
    /// The sequence is still in the dedup window.
    Duplicate,
}

/// A forward move of the commit point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAdvance {
    pub previous: u64,
    pub last_committed: u64,
    /// Broker offset to commit: one past the highest committed record.
    pub offset: i64,
    /// Sequence ranges given up on after the gap hold timeout.
    pub skipped: Vec<RangeInclusive<u64>>,
}

impl CommitAdvance {
    /// Number of sequences skipped by this advance.
    #[must_use]
    pub fn skipped_count(&self) -> u64 {
        self.skipped.iter().map(|r| r.end() - r.start() + 1).sum()
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub last_committed: u64,
    pub committed_offset: Option<i64>,
    /// Accepted sequences waiting behind a gap.
    pub buffered: Vec<u64>,
    /// Sequences currently in the dedup window.
    pub window_len: usize,
}

/// Dedup window and contiguous commit state for one subscription.
#[derive(Debug)]
pub struct ConsumerSession {
    group_id: String,
    topic: String,
    partition: i32,
    last_committed: u64,
    committed_offset: Option<i64>,
    capacity: usize,
    seen_order: VecDeque<u64>,
    seen: HashSet<u64>,
    /// Accepted sequences above `last_committed`, with their offsets.
    accepted: BTreeMap<u64, i64>,
    gap_hold: Duration,
    gap_since: Option<Instant>,
}

impl ConsumerSession {
    #[must_use]
    pub fn new(
        group_id: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        dedup_window: usize,
        gap_hold: Duration,
    ) -> Self {
        let capacity = dedup_window.max(1);
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            partition,
            last_committed: 0,
            committed_offset: None,
            capacity,
            seen_order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            accepted: BTreeMap::new(),
            gap_hold,
            gap_since: None,
        }
    }

    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    #[must_use]
    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    /// Check `sequence` against the dedup window and record it.
    ///
    /// The sequence enters the window on its first admission, whatever the
    /// callback later decides. The oldest entry is evicted once the window is
    /// full.
    pub fn admit(&mut self, sequence: u64) -> Admission {
        if self.seen.contains(&sequence) {
            return Admission::Duplicate;
        }

        if self.seen_order.len() == self.capacity {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen_order.push_back(sequence);
        self.seen.insert(sequence);

        Admission::Deliver
    }

    /// Record that the callback acknowledged `sequence` read at `offset`.
    ///
    /// Returns the resulting commit advance, if any. Sequences at or below
    /// the commit point never move it.
    pub fn accept(&mut self, sequence: u64, offset: i64, now: Instant) -> Option<CommitAdvance> {
        if sequence <= self.last_committed {
            return None;
        }
        self.accepted.insert(sequence, offset);
        self.advance(now)
    }

    /// Skip a gap whose hold timeout has elapsed. Called on the idle tick.
    pub fn poll_gaps(&mut self, now: Instant) -> Option<CommitAdvance> {
        self.advance(now)
    }

    fn advance(&mut self, now: Instant) -> Option<CommitAdvance> {
        let previous = self.last_committed;
        let mut skipped = Vec::new();

        loop {
            let mut moved = false;
            while let Some(offset) = self.accepted.remove(&(self.last_committed + 1)) {
                self.last_committed += 1;
                self.committed_offset = Some(
                    self.committed_offset
                        .map_or(offset + 1, |current| current.max(offset + 1)),
                );
                moved = true;
            }
            if moved {
                self.gap_since = None;
            }

            let Some((&next, _)) = self.accepted.first_key_value() else {
                self.gap_since = None;
                break;
            };

            match self.gap_since {
                Some(since) if now.saturating_duration_since(since) >= self.gap_hold => {
                    skipped.push(self.last_committed + 1..=next - 1);
                    self.last_committed = next - 1;
                    self.gap_since = Some(now);
                }
                Some(_) => break,
                None => {
                    self.gap_since = Some(now);
                    break;
                }
            }
        }

        if self.last_committed == previous {
            return None;
        }

        Some(CommitAdvance {
            previous,
            last_committed: self.last_committed,
            offset: self.committed_offset.unwrap_or(0),
            skipped,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            group_id: self.group_id.clone(),
            topic: self.topic.clone(),
            partition: self.partition,
            last_committed: self.last_committed,
            committed_offset: self.committed_offset,
            buffered: self.accepted.keys().copied().collect(),
            window_len: self.seen_order.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(5);

    fn session() -> ConsumerSession {
        ConsumerSession::new("g", "t", 0, 4, HOLD)
    }

    #[test]
    fn test_admit_detects_duplicates() {
        let mut s = session();
        assert_eq!(s.admit(5), Admission::Deliver);
        assert_eq!(s.admit(5), Admission::Duplicate);
        assert_eq!(s.snapshot().window_len, 1);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut s = session();
        for sequence in 1..=5 {
            assert_eq!(s.admit(sequence), Admission::Deliver);
        }
        // 1 was evicted by 5; 2..=5 remain.
        assert_eq!(s.admit(1), Admission::Deliver);
        assert_eq!(s.admit(5), Admission::Duplicate);
        assert_eq!(s.snapshot().window_len, 4);
    }

    #[test]
    fn test_contiguous_commit_waits_for_gap_fill() {
        let mut s = session();
        let now = Instant::now();

        assert_eq!(s.accept(5, 4, now), None);
        assert_eq!(s.accept(2, 1, now), None);
        assert_eq!(s.last_committed(), 0);

        let advance = s.accept(1, 0, now).unwrap();
        assert_eq!(advance.previous, 0);
        assert_eq!(advance.last_committed, 2);
        assert_eq!(advance.offset, 2);
        assert!(advance.skipped.is_empty());

        assert_eq!(s.accept(4, 3, now), None);
        let advance = s.accept(3, 2, now).unwrap();
        assert_eq!(advance.last_committed, 5);
        assert_eq!(advance.offset, 5);
        assert!(s.snapshot().buffered.is_empty());
    }

    #[test]
    fn test_at_or_below_commit_point_is_ignored() {
        let mut s = session();
        let now = Instant::now();
        s.accept(1, 0, now).unwrap();

        assert_eq!(s.accept(1, 7, now), None);
        assert_eq!(s.last_committed(), 1);
        assert_eq!(s.snapshot().committed_offset, Some(1));
    }

    #[test]
    fn test_gap_skipped_after_hold() {
        let mut s = session();
        let start = Instant::now();

        s.accept(1, 0, start).unwrap();
        assert_eq!(s.accept(4, 3, start), None);
        assert_eq!(s.poll_gaps(start + Duration::from_secs(4)), None);

        let advance = s.poll_gaps(start + HOLD).unwrap();
        assert_eq!(advance.previous, 1);
        assert_eq!(advance.last_committed, 4);
        assert_eq!(advance.skipped, vec![2..=3]);
        assert_eq!(advance.skipped_count(), 2);
        assert_eq!(advance.offset, 4);
    }

    #[test]
    fn test_next_gap_hold_starts_at_skip() {
        let mut s = session();
        let start = Instant::now();

        s.accept(2, 1, start);
        s.accept(4, 3, start);

        // First gap (1) expires; second gap (3) starts its hold now.
        let skip_at = start + HOLD;
        let advance = s.poll_gaps(skip_at).unwrap();
        assert_eq!(advance.skipped, vec![1..=1]);
        assert_eq!(advance.last_committed, 2);

        assert_eq!(s.poll_gaps(skip_at + Duration::from_secs(1)), None);
        let advance = s.poll_gaps(skip_at + HOLD).unwrap();
        assert_eq!(advance.skipped, vec![3..=3]);
        assert_eq!(advance.last_committed, 4);
    }

    #[test]
    fn test_gap_hold_restarts_after_partial_fill() {
        let mut s = session();
        let start = Instant::now();

        s.accept(3, 2, start);
        s.accept(6, 5, start);

        // Filling 1..=2 closes the first gap; 4..=5 is a new gap.
        let later = start + Duration::from_secs(4);
        s.accept(1, 0, later);
        let advance = s.accept(2, 1, later).unwrap();
        assert_eq!(advance.last_committed, 3);

        assert_eq!(s.poll_gaps(start + HOLD), None);
        let advance = s.poll_gaps(later + HOLD).unwrap();
        assert_eq!(advance.skipped, vec![4..=5]);
        assert_eq!(advance.last_committed, 6);
    }

    #[test]
    fn test_last_committed_is_monotonic() {
        let mut s = session();
        let start = Instant::now();
        let mut last = 0;

        for (i, sequence) in [3u64, 1, 2, 9, 4, 2, 7, 5, 6, 8].into_iter().enumerate() {
            let now = start + Duration::from_secs(i as u64);
            s.admit(sequence);
            s.accept(sequence, sequence as i64 - 1, now);
            assert!(s.last_committed() >= last);
            last = s.last_committed();
        }
        assert_eq!(s.last_committed(), 9);
    }
}
