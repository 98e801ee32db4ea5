use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::node_id::NodeId;
use crate::wire::{Datagram, Segment};

/// Periodic liveness announcement. The beacon has no thread of its own - the
///  processor asks it on every maintenance pass whether a Hello is due.
///
/// The configured interval doubles as the unit for peer dead-timeouts, so it must be
///  the same on all nodes of a mesh.
pub struct Beacon {
    node_id: NodeId,
    interval: Duration,
    next_announce: Instant,
    peer_count_hint: usize,
}

impl Beacon {
    pub fn new(node_id: NodeId, interval: Duration, now: Instant) -> Beacon {
        Beacon {
            node_id,
            interval,
            // announce immediately on startup
            next_announce: now,
            peer_count_hint: 0,
        }
    }

    /// The fixed announce interval, also used to compute peer dead-timeouts.
    pub fn beacon_interval(&self) -> Duration {
        self.interval
    }

    /// Informs the beacon of the current directory size. While nobody is known we
    ///  announce at twice the rate, so two nodes starting at the same time find each
    ///  other quickly; in a populated mesh the full interval is plenty.
    pub fn set_peer_count_hint(&mut self, peer_count: usize) {
        self.peer_count_hint = peer_count;
    }

    fn effective_interval(&self) -> Duration {
        if self.peer_count_hint == 0 {
            self.interval / 2
        } else {
            self.interval
        }
    }

    /// Returns the Hello datagram for the multicast group iff an announcement is
    ///  due, and schedules the next one.
    pub fn tick(&mut self, now: Instant) -> Option<Datagram> {
        if now < self.next_announce {
            return None;
        }

        self.next_announce = now + self.effective_interval();
        trace!("beacon: announcing {:?}", self.node_id);

        Some(Datagram::new(
            self.node_id,
            NodeId::NIL,
            Segment::Hello { node_id: self.node_id },
        ))
    }

    /// The Bye datagram announcing graceful departure, sent once during shutdown.
    pub fn make_bye(&self) -> Datagram {
        Datagram::new(
            self.node_id,
            NodeId::NIL,
            Segment::Bye { node_id: self.node_id },
        )
    }
}
