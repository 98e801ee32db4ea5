//! A connection-less, reliable message transport built directly on UDP datagrams.
//!
//! Peers find each other through periodic multicast beacons and exchange logical
//! *messages* of arbitrary size. A message is split into *segments* of at most 1024
//! payload bytes, each carried in its own datagram, and reassembled on the receiving
//! side. Delivery is at-least-once: a receiver acknowledges every completed message,
//! and requests full or partial retransmission when segments go missing. Ordered
//! delivery per sender is available on top of that via a sequence number carried in
//! every data segment.
//!
//! ## Design goals
//!
//! * No connections and no handshake - a datagram from an unknown peer is enough to
//!   start talking to it
//! * Peer-to-peer without a server role; discovery via multicast plus an optional
//!   list of statically configured peers for networks where multicast is filtered
//! * One dedicated worker task owns all mutable per-peer state, so none of it needs
//!   locking; socket readers and application senders only feed queues
//! * Failures never propagate as panics: malformed traffic is dropped, transient
//!   socket errors leave the affected segment pending for the next pass
//!
//! ## Wire format
//!
//! Every datagram starts with the same header, all integers in network byte order:
//!
//! ```ascii
//!  0: protocol version (u8) - datagrams with any other value are dropped
//!  1: segment type (u8):
//!     * 0 Hello        periodic liveness / discovery announcement
//!     * 1 Data         one segment of a message
//!     * 2 Acknowledge  a message was fully reassembled
//!     * 3 Bye          graceful departure
//!     * 4 Abort        give up on a message (either direction)
//!     * 5 Timeout      receiver-side stall, asks for a full resend
//!     * 6 Retransmit   asks for specific segments to be resent
//!     * >= 7           unknown, dropped
//!  2: sender node id (u128)
//! 18: recipient node id (u128) - nil when addressed to everyone
//! 34: type-specific body
//! ```
//!
//! Type-specific bodies:
//!
//! ```ascii
//! Hello / Bye:
//!  0: announced node id (u128)
//!
//! Data:
//!  0: message id (i32) - monotonic counter scoped to the sender
//!  4: message size (i64)
//! 12: total segments (u16)
//! 14: segment number (u16)
//! 16: segment offset (u32)
//! 20: sequence (u64) - 0 for unordered, > 0 for ordered delivery
//! 28: payload (remainder of the datagram, at most 1024 bytes)
//!
//! Acknowledge / Abort / Timeout:
//!  0: message id (i32)
//!
//! Retransmit:
//!  0: message id (i32)
//!  4: number of segments (varint)
//!  *: (repeated) segment number (u16)
//! ```
//!
//! ## Liveness
//!
//! Every node announces itself on the multicast group at the beacon interval. A peer
//! that stays silent for five beacon intervals is considered dead, removed from the
//! directory, and reported through a node-lost event. A node that shuts down cleanly
//! sends a Bye so its peers do not have to wait for the timeout.

pub mod beacon;
pub mod config;
pub mod events;
pub mod message;
pub mod node_directory;
pub mod node_id;
pub mod processor;
pub mod reassembler;
pub mod resequencer;
pub mod segmenter;
pub mod send_pipeline;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
