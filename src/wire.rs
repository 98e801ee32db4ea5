use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;

use crate::node_id::NodeId;

/// Datagrams of any other version are dropped without further parsing.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    Hello = 0,
    Data = 1,
    Acknowledge = 2,
    Bye = 3,
    Abort = 4,
    Timeout = 5,
    Retransmit = 6,
}

/// One segment of a message in flight. `message_id` is scoped to the sending node;
///  `sequence` is 0 for unordered delivery and strictly positive for messages that
///  must pass through the receiver's resequencer.
#[derive(Clone, Eq, PartialEq)]
pub struct DataChunk {
    pub message_id: i32,
    pub message_size: i64,
    pub total_segments: u16,
    pub segment_number: u16,
    pub segment_offset: u32,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Debug for DataChunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DATA(#{} {}/{} @{} seq={} len={})",
            self.message_id,
            self.segment_number,
            self.total_segments,
            self.segment_offset,
            self.sequence,
            self.payload.len()
        )
    }
}

/// The tagged body of a datagram, decoded once at the header boundary and matched
///  exhaustively from there on.
#[derive(Clone, Eq, PartialEq)]
pub enum Segment {
    Hello { node_id: NodeId },
    Data(DataChunk),
    Acknowledge { message_id: i32 },
    Bye { node_id: NodeId },
    Abort { message_id: i32 },
    Timeout { message_id: i32 },
    Retransmit { message_id: i32, segments: Vec<u16> },
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Hello { node_id } => write!(f, "HELLO({:?})", node_id),
            Segment::Data(chunk) => write!(f, "{:?}", chunk),
            Segment::Acknowledge { message_id } => write!(f, "ACK(#{})", message_id),
            Segment::Bye { node_id } => write!(f, "BYE({:?})", node_id),
            Segment::Abort { message_id } => write!(f, "ABORT(#{})", message_id),
            Segment::Timeout { message_id } => write!(f, "TIMEOUT(#{})", message_id),
            Segment::Retransmit { message_id, segments } => {
                write!(f, "RETRANSMIT(#{}:{:?})", message_id, segments)
            }
        }
    }
}

impl Segment {
    fn segment_type(&self) -> SegmentType {
        match self {
            Segment::Hello { .. } => SegmentType::Hello,
            Segment::Data(_) => SegmentType::Data,
            Segment::Acknowledge { .. } => SegmentType::Acknowledge,
            Segment::Bye { .. } => SegmentType::Bye,
            Segment::Abort { .. } => SegmentType::Abort,
            Segment::Timeout { .. } => SegmentType::Timeout,
            Segment::Retransmit { .. } => SegmentType::Retransmit,
        }
    }
}

/// A full datagram: the common header plus the type-specific body.
#[derive(Clone, Eq, PartialEq)]
pub struct Datagram {
    pub sender: NodeId,
    pub recipient: NodeId,
    pub segment: Segment,
}

impl Debug for Datagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DGRAM{{V{} {:?}->{:?} {:?}}}",
            PROTOCOL_VERSION, self.sender, self.recipient, self.segment
        )
    }
}

impl Datagram {
    pub fn new(sender: NodeId, recipient: NodeId, segment: Segment) -> Datagram {
        Datagram { sender, recipient, segment }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.segment.segment_type() as u8);
        self.sender.ser(buf);
        self.recipient.ser(buf);

        match &self.segment {
            Segment::Hello { node_id } | Segment::Bye { node_id } => {
                node_id.ser(buf);
            }
            Segment::Data(chunk) => {
                buf.put_i32(chunk.message_id);
                buf.put_i64(chunk.message_size);
                buf.put_u16(chunk.total_segments);
                buf.put_u16(chunk.segment_number);
                buf.put_u32(chunk.segment_offset);
                buf.put_u64(chunk.sequence);
                buf.put_slice(&chunk.payload);
            }
            Segment::Acknowledge { message_id }
            | Segment::Abort { message_id }
            | Segment::Timeout { message_id } => {
                buf.put_i32(*message_id);
            }
            Segment::Retransmit { message_id, segments } => {
                buf.put_i32(*message_id);
                buf.put_usize_varint(segments.len());
                for &segment_number in segments {
                    buf.put_u16(segment_number);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Datagram> {
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let raw_type = buf.try_get_u8()?;
        let segment_type = SegmentType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown segment type {}", raw_type))?;

        let sender = NodeId::try_deser(buf)?;
        let recipient = NodeId::try_deser(buf)?;

        let segment = match segment_type {
            SegmentType::Hello => Segment::Hello { node_id: NodeId::try_deser(buf)? },
            SegmentType::Bye => Segment::Bye { node_id: NodeId::try_deser(buf)? },
            SegmentType::Data => {
                let message_id = buf.try_get_i32()?;
                let message_size = buf.try_get_i64()?;
                let total_segments = buf.try_get_u16()?;
                let segment_number = buf.try_get_u16()?;
                let segment_offset = buf.try_get_u32()?;
                let sequence = buf.try_get_u64()?;
                let payload = buf.copy_to_bytes(buf.remaining());
                Segment::Data(DataChunk {
                    message_id,
                    message_size,
                    total_segments,
                    segment_number,
                    segment_offset,
                    sequence,
                    payload,
                })
            }
            SegmentType::Acknowledge => Segment::Acknowledge { message_id: buf.try_get_i32()? },
            SegmentType::Abort => Segment::Abort { message_id: buf.try_get_i32()? },
            SegmentType::Timeout => Segment::Timeout { message_id: buf.try_get_i32()? },
            SegmentType::Retransmit => {
                let message_id = buf.try_get_i32()?;
                let num_segments = buf.try_get_usize_varint()?;
                if num_segments > buf.remaining() / size_of::<u16>() {
                    bail!("retransmit segment list is truncated");
                }
                let mut segments = Vec::with_capacity(num_segments);
                for _ in 0..num_segments {
                    segments.push(buf.try_get_u16()?);
                }
                Segment::Retransmit { message_id, segments }
            }
        };

        Ok(Datagram { sender, recipient, segment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn sender() -> NodeId {
        NodeId::from_raw(0xaaaa0000_00000000_00000000_00000001)
    }

    fn recipient() -> NodeId {
        NodeId::from_raw(0xbbbb0000_00000000_00000000_00000002)
    }

    #[rstest]
    #[case::hello(Segment::Hello { node_id: sender() })]
    #[case::bye(Segment::Bye { node_id: sender() })]
    #[case::ack(Segment::Acknowledge { message_id: 17 })]
    #[case::ack_negative(Segment::Acknowledge { message_id: -1 })]
    #[case::abort(Segment::Abort { message_id: 0 })]
    #[case::timeout(Segment::Timeout { message_id: i32::MAX })]
    #[case::retransmit_empty(Segment::Retransmit { message_id: 3, segments: vec![] })]
    #[case::retransmit(Segment::Retransmit { message_id: 3, segments: vec![0, 5, 1000] })]
    #[case::data_empty_payload(Segment::Data(DataChunk {
        message_id: 9, message_size: 0, total_segments: 0, segment_number: 0,
        segment_offset: 0, sequence: 0, payload: Bytes::new(),
    }))]
    #[case::data(Segment::Data(DataChunk {
        message_id: 42, message_size: 2600, total_segments: 3, segment_number: 2,
        segment_offset: 2048, sequence: 7, payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
    }))]
    fn test_datagram_round_trip(#[case] segment: Segment) {
        let datagram = Datagram::new(sender(), recipient(), segment);

        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);

        let mut b: &[u8] = buf.as_ref();
        let deser = Datagram::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(datagram, deser);
    }

    #[test]
    fn test_deser_rejects_wrong_protocol_version() {
        let datagram = Datagram::new(sender(), recipient(), Segment::Acknowledge { message_id: 1 });
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        buf[0] = PROTOCOL_VERSION + 1;

        let mut b: &[u8] = buf.as_ref();
        assert!(Datagram::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_rejects_unknown_segment_type() {
        let datagram = Datagram::new(sender(), recipient(), Segment::Acknowledge { message_id: 1 });
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        buf[1] = 7;

        let mut b: &[u8] = buf.as_ref();
        assert!(Datagram::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::header_only(2)]
    #[case::mid_node_id(10)]
    #[case::mid_body(36)]
    fn test_deser_rejects_truncated_datagram(#[case] len: usize) {
        let datagram = Datagram::new(sender(), recipient(), Segment::Timeout { message_id: 1 });
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);

        let mut b: &[u8] = &buf.as_ref()[..len];
        assert!(Datagram::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated_retransmit_list() {
        let datagram = Datagram::new(
            sender(),
            recipient(),
            Segment::Retransmit { message_id: 1, segments: vec![1, 2, 3] },
        );
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);

        // cut off the last segment number
        let mut b: &[u8] = &buf.as_ref()[..buf.len() - 2];
        assert!(Datagram::deser(&mut b).is_err());
    }

    #[test]
    fn test_data_payload_is_datagram_remainder() {
        let chunk = DataChunk {
            message_id: 1,
            message_size: 4,
            total_segments: 1,
            segment_number: 0,
            segment_offset: 0,
            sequence: 0,
            payload: Bytes::from_static(b"abcd"),
        };
        let datagram = Datagram::new(sender(), recipient(), Segment::Data(chunk));

        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        // header 34 bytes + fixed data fields 28 bytes + payload
        assert_eq!(buf.len(), 34 + 28 + 4);
    }
}
