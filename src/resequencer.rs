use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bytes::Bytes;
use tracing::debug;

/// A fully reassembled message waiting for its turn in the delivery order.
#[derive(Debug, Clone)]
pub struct SequencedMessage {
    pub sequence: u64,
    pub payload: Bytes,
}

impl PartialEq for SequencedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}
impl Eq for SequencedMessage {}

impl Ord for SequencedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}
impl PartialOrd for SequencedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Restores strict per-sender delivery order for sequence-tagged messages: completed
///  messages go into a min-heap, and are released only when their sequence is exactly
///  the next expected one. Sequence 0 is reserved for "no ordering requested" and
///  never enters a resequencer.
pub struct Resequencer {
    next_expected: u64,
    heap: BinaryHeap<Reverse<SequencedMessage>>,
}

impl Default for Resequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resequencer {
    pub fn new() -> Resequencer {
        Resequencer {
            next_expected: 1,
            heap: BinaryHeap::new(),
        }
    }

    /// The sequence number of the next message eligible for release.
    pub fn next_expected_sequence(&self) -> u64 {
        self.next_expected
    }

    /// Whether a message with this sequence is still deliverable: not already
    ///  released, and not further ahead of the release point than the window allows.
    pub fn accepts(&self, sequence: u64, max_ahead: usize) -> bool {
        sequence >= self.next_expected && sequence - self.next_expected <= max_ahead as u64
    }

    /// Buffers a completed message. Returns true iff the message's sequence equals
    ///  the next expected one, i.e. at least one message can now be released via
    ///  `pop`. Messages whose sequence was already released are dropped.
    pub fn resequence(&mut self, message: SequencedMessage) -> bool {
        if message.sequence < self.next_expected {
            debug!(
                "sequence {} already released (next expected {}) - dropping",
                message.sequence, self.next_expected
            );
            return false;
        }

        let ready = message.sequence == self.next_expected;
        self.heap.push(Reverse(message));
        ready
    }

    /// Releases the heap top iff its sequence is exactly the next expected one.
    ///  Callers loop until `None` to drain every now-contiguous message. Duplicate
    ///  buffered entries for an already-released sequence are discarded silently, so
    ///  a sequence is released at most once.
    pub fn pop(&mut self) -> Option<SequencedMessage> {
        loop {
            let top_sequence = self.heap.peek()?.0.sequence;

            if top_sequence < self.next_expected {
                // duplicate of a sequence released in an earlier pop
                self.heap.pop();
                continue;
            }
            if top_sequence != self.next_expected {
                return None;
            }

            self.next_expected += 1;
            return self.heap.pop().map(|r| r.0);
        }
    }

    /// Forgets everything buffered and starts over at sequence 1. Used when the
    ///  sending peer is detected to have restarted.
    pub fn reset(&mut self) {
        self.heap.clear();
        self.next_expected = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn msg(sequence: u64) -> SequencedMessage {
        SequencedMessage {
            sequence,
            payload: Bytes::from(sequence.to_string()),
        }
    }

    fn drain(resequencer: &mut Resequencer) -> Vec<u64> {
        let mut released = Vec::new();
        while let Some(message) = resequencer.pop() {
            released.push(message.sequence);
        }
        released
    }

    #[test]
    fn test_in_order_release() {
        let mut resequencer = Resequencer::new();
        assert_eq!(resequencer.next_expected_sequence(), 1);

        assert!(resequencer.resequence(msg(1)));
        assert_eq!(drain(&mut resequencer), vec![1]);

        assert!(resequencer.resequence(msg(2)));
        assert_eq!(drain(&mut resequencer), vec![2]);
        assert_eq!(resequencer.next_expected_sequence(), 3);
    }

    #[test]
    fn test_scenario_c_withholds_until_gap_filled() {
        let mut resequencer = Resequencer::new();

        // message 2 completes before message 1
        assert!(!resequencer.resequence(msg(2)));
        assert_eq!(drain(&mut resequencer), Vec::<u64>::new());

        assert!(resequencer.resequence(msg(1)));
        assert_eq!(drain(&mut resequencer), vec![1, 2]);
    }

    #[rstest]
    #[case::reverse(vec![5, 4, 3, 2, 1])]
    #[case::scrambled(vec![3, 1, 5, 2, 4])]
    #[case::in_order(vec![1, 2, 3, 4, 5])]
    fn test_releases_are_strictly_increasing_without_gaps(#[case] arrival: Vec<u64>) {
        let mut resequencer = Resequencer::new();

        let mut released = Vec::new();
        for sequence in arrival {
            resequencer.resequence(msg(sequence));
            released.extend(drain(&mut resequencer));
        }

        assert_eq!(released, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_push_releases_once() {
        let mut resequencer = Resequencer::new();

        resequencer.resequence(msg(2));
        resequencer.resequence(msg(2));
        resequencer.resequence(msg(1));

        assert_eq!(drain(&mut resequencer), vec![1, 2]);

        // a late duplicate of an already released sequence is dropped on push
        assert!(!resequencer.resequence(msg(2)));
        assert_eq!(drain(&mut resequencer), Vec::<u64>::new());
        assert_eq!(resequencer.next_expected_sequence(), 3);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut resequencer = Resequencer::new();
        resequencer.resequence(msg(1));
        resequencer.resequence(msg(3));
        assert_eq!(drain(&mut resequencer), vec![1]);

        resequencer.reset();
        assert_eq!(resequencer.next_expected_sequence(), 1);

        assert!(resequencer.resequence(msg(1)));
        assert_eq!(drain(&mut resequencer), vec![1]);
    }

    #[rstest]
    #[case::released(0, false)]
    #[case::next(1, true)]
    #[case::within(4, true)]
    #[case::at_window_edge(5, true)]
    #[case::beyond(6, false)]
    fn test_accepts_window(#[case] sequence: u64, #[case] expected: bool) {
        let resequencer = Resequencer::new();
        assert_eq!(resequencer.accepts(sequence, 4), expected);
    }
}
