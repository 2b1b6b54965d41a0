use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of offering a sequenced item to a [`SequenceTracker`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// `seq` was the next expected number; the caller delivers `T` and then flushes.
    Deliver(T),
    /// At or below the last delivered number, or already buffered.
    Duplicate,
    /// Ahead of a gap; parked until the gap fills.
    Buffered { pending: usize },
    /// Ahead of a gap but the buffer is full; the item was dropped.
    Overflow { limit: usize },
}

/// The buffer gave up waiting for a missing number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapSkip {
    pub expected: u64,
    pub resume_at: u64,
    pub waited: Duration,
}

#[derive(Debug)]
struct Parked<T> {
    item: T,
    since: Instant,
}

/// Per-sender reorder state: the last delivered number and the items waiting behind a gap.
///
/// `pending` never holds a number at or below `last_delivered`.
#[derive(Debug)]
pub struct SequenceTracker<T> {
    last_delivered: i64,
    pending: BTreeMap<u64, Parked<T>>,
}

impl<T> Default for SequenceTracker<T> {
    fn default() -> Self {
        Self {
            last_delivered: -1,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> SequenceTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_delivered(&self) -> i64 {
        self.last_delivered
    }

    pub fn next_expected(&self) -> u64 {
        (self.last_delivered + 1) as u64
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn admit(&mut self, seq: u64, item: T, max_pending: usize, now: Instant) -> Admission<T> {
        let expected = self.next_expected();
        if seq < expected || self.pending.contains_key(&seq) {
            return Admission::Duplicate;
        }
        if seq == expected {
            self.last_delivered = seq as i64;
            return Admission::Deliver(item);
        }
        if self.pending.len() >= max_pending {
            return Admission::Overflow { limit: max_pending };
        }
        self.pending.insert(seq, Parked { item, since: now });
        Admission::Buffered {
            pending: self.pending.len(),
        }
    }

    /// Remove the parked item that is now next in line, if any. One item per call: the
    /// caller re-admits it and calls again after delivering.
    pub fn take_next(&mut self) -> Option<(u64, T)> {
        let expected = self.next_expected();
        self.pending
            .remove(&expected)
            .map(|parked| (expected, parked.item))
    }

    /// If the oldest parked item has waited longer than `gap_timeout`, skip the missing
    /// numbers so the smallest parked item becomes next in line.
    pub fn expire(&mut self, now: Instant, gap_timeout: Duration) -> Option<GapSkip> {
        let oldest = self.pending.values().map(|parked| parked.since).min()?;
        let waited = now.saturating_duration_since(oldest);
        if waited < gap_timeout {
            return None;
        }
        let resume_at = *self.pending.keys().next()?;
        let expected = self.next_expected();
        self.last_delivered = resume_at as i64 - 1;
        Some(GapSkip {
            expected,
            resume_at,
            waited,
        })
    }

    pub fn reset(&mut self) {
        self.last_delivered = -1;
        self.pending.clear();
    }
}

/// Outgoing counter for one destination peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingSequence {
    next: u64,
}

impl OutgoingSequence {
    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Feed one arrival and run the flush loop the way the ordering layer does.
    fn arrive(tracker: &mut SequenceTracker<u64>, seq: u64, out: &mut Vec<u64>) {
        let mut queue = vec![seq];
        while let Some(seq) = queue.pop() {
            if let Admission::Deliver(item) = tracker.admit(seq, seq, 1024, Instant::now()) {
                out.push(item);
                if let Some((next, _)) = tracker.take_next() {
                    queue.push(next);
                }
            }
        }
    }

    #[test]
    fn in_order_and_duplicates() {
        let mut tracker = SequenceTracker::new();
        let mut out = Vec::new();
        for seq in [0, 1, 1, 0, 2] {
            arrive(&mut tracker, seq, &mut out);
        }
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(tracker.last_delivered(), 2);
    }

    #[test]
    fn gap_buffers_until_filled() {
        let mut tracker = SequenceTracker::new();
        let mut out = Vec::new();
        arrive(&mut tracker, 2, &mut out);
        arrive(&mut tracker, 1, &mut out);
        assert!(out.is_empty());
        assert_eq!(tracker.pending_len(), 2);
        arrive(&mut tracker, 0, &mut out);
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn buffered_duplicate_is_dropped() {
        let mut tracker = SequenceTracker::new();
        let now = Instant::now();
        assert_eq!(
            tracker.admit(3, "a", 8, now),
            Admission::Buffered { pending: 1 }
        );
        assert_eq!(tracker.admit(3, "b", 8, now), Admission::Duplicate);
    }

    #[test]
    fn overflow_rejects_beyond_limit() {
        let mut tracker = SequenceTracker::new();
        let now = Instant::now();
        assert!(matches!(tracker.admit(5, 5, 2, now), Admission::Buffered { .. }));
        assert!(matches!(tracker.admit(6, 6, 2, now), Admission::Buffered { .. }));
        assert_eq!(tracker.admit(7, 7, 2, now), Admission::Overflow { limit: 2 });
        // the next expected number is still accepted while the buffer is full
        assert_eq!(tracker.admit(0, 0, 2, now), Admission::Deliver(0));
    }

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn expire_skips_to_smallest_parked() {
        let mut tracker = SequenceTracker::new();
        let timeout = Duration::from_secs(2);
        tracker.admit(4, 4, 8, Instant::now());
        tracker.admit(7, 7, 8, Instant::now());
        assert_eq!(tracker.expire(Instant::now(), timeout), None);

        tokio::time::advance(Duration::from_secs(3)).await;
        let skip = tracker.expire(Instant::now(), timeout).unwrap();
        assert_eq!(skip.expected, 0);
        assert_eq!(skip.resume_at, 4);
        assert!(skip.waited >= timeout);
        assert_eq!(tracker.take_next(), Some((4, 4)));
        assert_eq!(tracker.admit(4, 4, 8, Instant::now()), Admission::Deliver(4));
        assert_eq!(tracker.take_next(), None);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut tracker = SequenceTracker::new();
        let mut out = Vec::new();
        arrive(&mut tracker, 0, &mut out);
        arrive(&mut tracker, 5, &mut out);
        tracker.reset();
        assert_eq!(tracker.last_delivered(), -1);
        assert_eq!(tracker.pending_len(), 0);
        arrive(&mut tracker, 0, &mut out);
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn outgoing_counts_from_zero() {
        let mut outgoing = OutgoingSequence::default();
        assert_eq!(outgoing.peek(), 0);
        outgoing.advance();
        outgoing.advance();
        assert_eq!(outgoing.peek(), 2);
    }

    proptest! {
        #[test]
        fn any_permutation_delivers_in_order(
            order in (1usize..48).prop_flat_map(|n| Just((0..n as u64).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let mut tracker = SequenceTracker::new();
            let mut out = Vec::new();
            for seq in &order {
                arrive(&mut tracker, *seq, &mut out);
            }
            let expected: Vec<u64> = (0..order.len() as u64).collect();
            prop_assert_eq!(out, expected);
            prop_assert_eq!(tracker.pending_len(), 0);
        }

        #[test]
        fn replays_never_deliver_twice(
            order in (1usize..32).prop_flat_map(|n| Just((0..n as u64).collect::<Vec<_>>()).prop_shuffle()),
            replays in prop::collection::vec(0u64..32, 0..16),
        ) {
            let mut tracker = SequenceTracker::new();
            let mut out = Vec::new();
            for seq in order.iter().chain(replays.iter().filter(|seq| (**seq as usize) < order.len())) {
                arrive(&mut tracker, *seq, &mut out);
            }
            let expected: Vec<u64> = (0..order.len() as u64).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
