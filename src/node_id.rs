use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// A node's identity, generated once per transport instance. It is carried in every
///  datagram, so a peer that restarts (and generates a fresh id) is recognizable as a
///  new instance even when it reuses its old endpoint.
///
/// NB: Uniqueness is not a security feature - the id only needs to be distinct from
///      other instances on the same network, which a random 128-bit value guarantees
///      for all practical purposes.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u128);

impl NodeId {
    /// The nil id: used as the recipient of datagrams addressed to everyone, and as
    ///  the wildcard recipient of outbound messages that should be fanned out.
    pub const NIL: NodeId = NodeId(0);

    pub fn generate() -> NodeId {
        NodeId(Uuid::new_v4().as_u128())
    }

    pub const fn from_raw(raw: u128) -> NodeId {
        NodeId(raw)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        Ok(NodeId(
            buf.try_get_u128().map_err(|e| anyhow!("truncated node id: {}", e))?,
        ))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "[nil]")
        } else {
            // the top 32 bits are enough to tell nodes apart in log output
            write!(f, "[{:08x}]", (self.0 >> 96) as u32)
        }
    }
}
