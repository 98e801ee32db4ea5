use std::sync::Arc;

use bit_set::BitSet;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::message::{SerializationState, SerializedMessage};

/// One segment's worth of payload, ready to be put on the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingSegment {
    pub segment_number: u16,
    pub segment_offset: u32,
    pub payload: Bytes,
}

enum State {
    /// The backing message has not reported completion yet.
    Uninitialized,
    Ready {
        payload: Bytes,
        total_segments: u16,
        /// set bit = segment still pending
        pending: BitSet,
    },
    /// Serialization of the backing message failed - to be discarded by the caller.
    Invalid,
}

/// Splits one serialized message into fixed-size segments and tracks which of them
///  still need to be sent. One segmenter exists per (recipient, message id) pair;
///  fan-out to several recipients creates several segmenters sharing the same
///  backing message.
pub struct Segmenter {
    message: Arc<SerializedMessage>,
    segment_size: usize,
    sequence: u64,
    state: State,
}

impl Segmenter {
    pub fn new(message: Arc<SerializedMessage>, segment_size: usize, sequence: u64) -> Segmenter {
        assert!(segment_size > 0);
        Segmenter {
            message,
            segment_size,
            sequence,
            state: State::Uninitialized,
        }
    }

    /// Computes the segment count and marks every segment pending, once the backing
    ///  message reports completion. Until then this is a no-op, and the segmenter is
    ///  not sendable. A failed serialization marks the segmenter invalid.
    pub fn initialize(&mut self) {
        if !matches!(self.state, State::Uninitialized) {
            return;
        }

        match self.message.state() {
            SerializationState::Serializing => {}
            SerializationState::Invalid => {
                debug!("backing message failed to serialize - marking segmenter invalid");
                self.state = State::Invalid;
            }
            SerializationState::Complete => {
                let payload = self.message.bytes().expect("complete message has bytes");
                if payload.is_empty() {
                    warn!("serialized message is empty - marking segmenter invalid");
                    self.state = State::Invalid;
                    return;
                }

                let total_segments = payload.len().div_ceil(self.segment_size);
                if total_segments > u16::MAX as usize {
                    warn!(
                        "message of {} bytes exceeds the addressable segment range - marking segmenter invalid",
                        payload.len()
                    );
                    self.state = State::Invalid;
                    return;
                }

                let mut pending = BitSet::with_capacity(total_segments);
                for i in 0..total_segments {
                    pending.insert(i);
                }

                self.state = State::Ready {
                    payload,
                    total_segments: total_segments as u16,
                    pending,
                };
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.state, State::Invalid)
    }

    /// True once every segment has been sent (and not re-marked pending since).
    pub fn is_complete(&self) -> bool {
        match &self.state {
            State::Ready { pending, total_segments, .. } => {
                *total_segments > 0 && pending.is_empty()
            }
            _ => false,
        }
    }

    pub fn total_segments(&self) -> u16 {
        match &self.state {
            State::Ready { total_segments, .. } => *total_segments,
            _ => 0,
        }
    }

    pub fn message_size(&self) -> usize {
        match &self.state {
            State::Ready { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The lowest-indexed pending segment's bytes - a pure peek, no state change.
    pub fn next_pending_segment(&self) -> Option<PendingSegment> {
        let State::Ready { payload, pending, .. } = &self.state else {
            return None;
        };

        let segment_number = pending.iter().next()?;
        let offset = segment_number * self.segment_size;
        let end = usize::min(offset + self.segment_size, payload.len());

        Some(PendingSegment {
            segment_number: segment_number as u16,
            segment_offset: offset as u32,
            payload: payload.slice(offset..end),
        })
    }

    /// Clears the pending bit for a segment that went out on the wire.
    pub fn mark_sent(&mut self, segment_number: u16) {
        if let State::Ready { pending, total_segments, .. } = &mut self.state {
            if segment_number >= *total_segments {
                debug!("mark_sent for out-of-range segment {} - ignoring", segment_number);
                return;
            }
            pending.remove(segment_number as usize);
        }
    }

    /// Re-marks the given segments pending, triggered by an explicit Retransmit
    ///  request from the peer. Out-of-range indices are ignored.
    pub fn mark_for_retransmission(&mut self, segment_numbers: &[u16]) {
        if let State::Ready { pending, total_segments, .. } = &mut self.state {
            for &segment_number in segment_numbers {
                if segment_number >= *total_segments {
                    debug!(
                        "retransmit request for out-of-range segment {} - ignoring",
                        segment_number
                    );
                    continue;
                }
                pending.insert(segment_number as usize);
            }
        }
    }

    /// Re-marks every segment pending - a full resend, triggered by a Timeout from
    ///  the peer.
    pub fn mark_all_for_retransmission(&mut self) {
        if let State::Ready { pending, total_segments, .. } = &mut self.state {
            for i in 0..*total_segments as usize {
                pending.insert(i);
            }
        }
    }
}
