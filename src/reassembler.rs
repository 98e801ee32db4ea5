use std::net::SocketAddr;

use bit_set::BitSet;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::wire::DataChunk;

/// Accumulates the segments of one inbound message until all of them have arrived.
///  One buffer exists per (sender, message id) pair, created from the first Data
///  segment seen for that message id - UDP reordering means that need not be
///  segment 0.
pub struct ReassembledMessage {
    buffer: Vec<u8>,
    received: BitSet,
    num_received: usize,
    total_segments: u16,
    sequence: u64,
    sender_endpoint: SocketAddr,
    last_activity: Instant,
}

impl ReassembledMessage {
    pub fn new(
        message_size: i64,
        total_segments: u16,
        sequence: u64,
        sender_endpoint: SocketAddr,
        now: Instant,
    ) -> ReassembledMessage {
        ReassembledMessage {
            buffer: vec![0u8; usize::try_from(message_size).unwrap_or(0)],
            received: BitSet::with_capacity(total_segments as usize),
            num_received: 0,
            total_segments,
            sequence,
            sender_endpoint,
            last_activity: now,
        }
    }

    pub fn from_first_chunk(chunk: &DataChunk, sender_endpoint: SocketAddr, now: Instant) -> ReassembledMessage {
        let mut message = ReassembledMessage::new(
            chunk.message_size,
            chunk.total_segments,
            chunk.sequence,
            sender_endpoint,
            now,
        );
        message.reassemble(chunk.segment_number, chunk.segment_offset, &chunk.payload, now);
        message
    }

    /// Copies one segment's bytes into place and records it as received. Duplicates
    ///  and segments that do not fit the announced geometry are ignored - UDP may
    ///  duplicate, reorder, or corrupt-and-drop freely.
    pub fn reassemble(&mut self, segment_number: u16, segment_offset: u32, data: &[u8], now: Instant) {
        self.last_activity = now;

        if segment_number >= self.total_segments {
            debug!(
                "segment number {} out of range for message with {} segments - ignoring",
                segment_number, self.total_segments
            );
            return;
        }

        let offset = segment_offset as usize;
        if offset + data.len() > self.buffer.len() {
            debug!(
                "segment {} overruns the announced message size ({} + {} > {}) - ignoring",
                segment_number,
                offset,
                data.len(),
                self.buffer.len()
            );
            return;
        }

        if !self.received.insert(segment_number as usize) {
            debug!("duplicate segment {} - ignoring", segment_number);
            return;
        }

        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.num_received += 1;
    }

    /// True iff every segment index `0..total_segments` has been recorded.
    pub fn is_complete(&self) -> bool {
        self.total_segments > 0 && self.num_received == self.total_segments as usize
    }

    /// The ordering key for delivery routing: 0 means deliver immediately, anything
    ///  else must pass through the sender's resequencer.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn sender_endpoint(&self) -> SocketAddr {
        self.sender_endpoint
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Re-arms the activity timestamp, e.g. after a retransmission request went out,
    ///  so the next request waits a full interval again.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn total_segments(&self) -> u16 {
        self.total_segments
    }

    /// The segment numbers not received yet, at most `max` of them.
    pub fn missing_segments(&self, max: usize) -> Vec<u16> {
        (0..self.total_segments)
            .filter(|&i| !self.received.contains(i as usize))
            .take(max)
            .collect()
    }

    /// The reassembled payload. Only meaningful once `is_complete()`.
    pub fn into_payload(self) -> Bytes {
        Bytes::from(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn endpoint() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4567))
    }

    fn segments_of(payload: &[u8], segment_size: usize) -> Vec<(u16, u32, Vec<u8>)> {
        payload
            .chunks(segment_size)
            .enumerate()
            .map(|(i, chunk)| (i as u16, (i * segment_size) as u32, chunk.to_vec()))
            .collect()
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reverse(vec![2, 1, 0])]
    #[case::scrambled(vec![2, 0, 1])]
    fn test_completion_is_order_independent(#[case] arrival_order: Vec<usize>) {
        let payload = vec![42u8; 2600];
        let segments = segments_of(&payload, 1024);
        let now = Instant::now();

        let mut message = ReassembledMessage::new(2600, 3, 0, endpoint(), now);
        for (i, &idx) in arrival_order.iter().enumerate() {
            let (number, offset, data) = &segments[idx];
            message.reassemble(*number, *offset, data, now);

            if i < arrival_order.len() - 1 {
                assert!(!message.is_complete());
            }
        }

        assert!(message.is_complete());
        assert_eq!(message.into_payload(), Bytes::from(payload));
    }

    #[test]
    fn test_scenario_a_sizes() {
        // 2600 bytes at segment size 1024: segments of 1024, 1024 and 552 bytes
        let payload: Vec<u8> = (0..2600u32).map(|i| i as u8).collect();
        let segments = segments_of(&payload, 1024);
        assert_eq!(segments[0].2.len(), 1024);
        assert_eq!(segments[1].2.len(), 1024);
        assert_eq!(segments[2].2.len(), 552);

        let now = Instant::now();
        let mut message = ReassembledMessage::new(2600, 3, 0, endpoint(), now);
        for (number, offset, data) in &segments {
            message.reassemble(*number, *offset, data, now);
        }
        assert!(message.is_complete());
        assert_eq!(message.into_payload(), Bytes::from(payload));
    }

    #[test]
    fn test_duplicates_do_not_complete_early() {
        let now = Instant::now();
        let mut message = ReassembledMessage::new(8, 2, 0, endpoint(), now);

        message.reassemble(0, 0, b"abcd", now);
        message.reassemble(0, 0, b"abcd", now);
        message.reassemble(0, 0, b"abcd", now);
        assert!(!message.is_complete());

        message.reassemble(1, 4, b"efgh", now);
        assert!(message.is_complete());
        assert_eq!(message.into_payload(), Bytes::from_static(b"abcdefgh"));
    }

    #[test]
    fn test_out_of_range_segment_is_ignored() {
        let now = Instant::now();
        let mut message = ReassembledMessage::new(4, 1, 0, endpoint(), now);

        message.reassemble(5, 0, b"abcd", now);
        assert!(!message.is_complete());
    }

    #[test]
    fn test_overrunning_segment_is_ignored() {
        let now = Instant::now();
        let mut message = ReassembledMessage::new(4, 1, 0, endpoint(), now);

        message.reassemble(0, 2, b"abcd", now);
        assert!(!message.is_complete());

        message.reassemble(0, 0, b"abcd", now);
        assert!(message.is_complete());
    }

    #[test]
    fn test_from_first_chunk_records_that_chunk() {
        let chunk = DataChunk {
            message_id: 1,
            message_size: 8,
            total_segments: 2,
            segment_number: 1,
            segment_offset: 4,
            sequence: 3,
            payload: Bytes::from_static(b"efgh"),
        };
        let now = Instant::now();
        let mut message = ReassembledMessage::from_first_chunk(&chunk, endpoint(), now);

        assert_eq!(message.sequence(), 3);
        assert!(!message.is_complete());

        message.reassemble(0, 0, b"abcd", now);
        assert!(message.is_complete());
        assert_eq!(message.into_payload(), Bytes::from_static(b"abcdefgh"));
    }

    #[test]
    fn test_missing_segments() {
        let now = Instant::now();
        let mut message = ReassembledMessage::new(5000, 5, 0, endpoint(), now);
        assert_eq!(message.missing_segments(10), vec![0, 1, 2, 3, 4]);
        assert_eq!(message.missing_segments(2), vec![0, 1]);

        message.reassemble(1, 1024, &[0u8; 1024], now);
        message.reassemble(3, 3072, &[0u8; 1024], now);
        assert_eq!(message.missing_segments(10), vec![0, 2, 4]);
    }

    #[test]
    fn test_last_activity_advances() {
        let start = Instant::now();
        let mut message = ReassembledMessage::new(8, 2, 0, endpoint(), start);
        assert_eq!(message.last_activity(), start);

        let later = start + std::time::Duration::from_secs(5);
        message.reassemble(0, 0, b"abcd", later);
        assert_eq!(message.last_activity(), later);
    }
}
