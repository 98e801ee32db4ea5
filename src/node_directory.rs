use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::node_id::NodeId;
use crate::reassembler::ReassembledMessage;
use crate::resequencer::Resequencer;
use crate::segmenter::Segmenter;

/// Everything we track about one peer: where to reach it, when we last heard from
///  it, and all per-message transfer state in both directions.
pub struct NodeInfo {
    pub endpoint: SocketAddr,
    /// Nil for a statically configured peer we have not heard from yet. Once set to
    ///  a valid id it only changes through an explicit restart.
    pub node_id: NodeId,
    pub last_segment_received: Instant,
    /// outbound transfers, by message id
    pub segmenters: FxHashMap<i32, Segmenter>,
    /// inbound transfers, by message id
    pub reassemblers: FxHashMap<i32, ReassembledMessage>,
    pub resequencer: Resequencer,
    /// message ids delivered recently - late duplicates of these are ignored (but
    ///  re-acknowledged, in case the original Acknowledge got lost)
    recently_delivered: VecDeque<i32>,
}

impl NodeInfo {
    pub fn new(endpoint: SocketAddr, node_id: NodeId, now: Instant) -> NodeInfo {
        NodeInfo {
            endpoint,
            node_id,
            last_segment_received: now,
            segmenters: FxHashMap::default(),
            reassemblers: FxHashMap::default(),
            resequencer: Resequencer::new(),
            recently_delivered: VecDeque::new(),
        }
    }

    const DELIVERED_LOG_SIZE: usize = 256;

    pub fn record_delivered(&mut self, message_id: i32) {
        if self.recently_delivered.len() == Self::DELIVERED_LOG_SIZE {
            self.recently_delivered.pop_front();
        }
        self.recently_delivered.push_back(message_id);
    }

    pub fn was_delivered(&self, message_id: i32) -> bool {
        self.recently_delivered.contains(&message_id)
    }
}

/// What a Hello announcement meant for the directory.
#[derive(Debug, Eq, PartialEq)]
pub enum HelloOutcome {
    /// first time we hear from this node
    Discovered,
    /// known node, liveness refreshed
    Refreshed,
    /// a different id announced itself from a known endpoint - the peer restarted
    Restarted { previous: NodeId },
}

/// The per-peer state store, owned and mutated exclusively by the processor loop.
///  Discovered nodes are keyed by their id; statically configured peers are keyed by
///  endpoint since their id is unknown until they announce themselves.
pub struct NodeDirectory {
    nodes: FxHashMap<NodeId, NodeInfo>,
    endpoint_index: FxHashMap<SocketAddr, NodeId>,
    static_nodes: FxHashMap<SocketAddr, NodeInfo>,
}

impl NodeDirectory {
    pub fn new(static_peers: &[SocketAddr], now: Instant) -> NodeDirectory {
        let static_nodes = static_peers
            .iter()
            .map(|&endpoint| (endpoint, NodeInfo::new(endpoint, NodeId::NIL, now)))
            .collect();

        NodeDirectory {
            nodes: FxHashMap::default(),
            endpoint_index: FxHashMap::default(),
            static_nodes,
        }
    }

    pub fn on_hello(&mut self, node_id: NodeId, endpoint: SocketAddr, now: Instant) -> HelloOutcome {
        if let Some(&existing_id) = self.endpoint_index.get(&endpoint) {
            if existing_id != node_id {
                debug!(
                    "{:?} announced itself from {:?} which previously belonged to {:?} - peer restarted",
                    node_id, endpoint, existing_id
                );
                self.nodes.remove(&existing_id);
                self.endpoint_index.insert(endpoint, node_id);
                self.nodes.insert(node_id, NodeInfo::new(endpoint, node_id, now));
                return HelloOutcome::Restarted { previous: existing_id };
            }
        }

        match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.last_segment_received = now;
                if node.endpoint != endpoint {
                    debug!("{:?} moved from {:?} to {:?}", node_id, node.endpoint, endpoint);
                    self.endpoint_index.remove(&node.endpoint);
                    self.endpoint_index.insert(endpoint, node_id);
                    node.endpoint = endpoint;
                }
                HelloOutcome::Refreshed
            }
            None => {
                self.endpoint_index.insert(endpoint, node_id);
                self.nodes.insert(node_id, NodeInfo::new(endpoint, node_id, now));
                HelloOutcome::Discovered
            }
        }
    }

    /// Per-peer state for an inbound data/control segment, creating the entry if
    ///  this sender was never seen before. Returns whether the node is new.
    pub fn get_or_insert(
        &mut self,
        node_id: NodeId,
        endpoint: SocketAddr,
        now: Instant,
    ) -> (&mut NodeInfo, bool) {
        let newly_discovered = !self.nodes.contains_key(&node_id);
        if newly_discovered {
            self.endpoint_index.insert(endpoint, node_id);
        }

        let node = self
            .nodes
            .entry(node_id)
            .or_insert_with(|| NodeInfo::new(endpoint, node_id, now));
        node.last_segment_received = now;

        (node, newly_discovered)
    }

    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(node_id)
    }

    /// The peer a control segment refers to: by id if the sender ever announced
    ///  itself, otherwise by endpoint (a static peer that never sent a Hello still
    ///  acknowledges messages we send it).
    pub fn resolve_mut(&mut self, node_id: &NodeId, endpoint: SocketAddr) -> Option<&mut NodeInfo> {
        if self.nodes.contains_key(node_id) {
            return self.nodes.get_mut(node_id);
        }
        self.static_nodes.get_mut(&endpoint)
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let node = self.nodes.remove(node_id)?;
        self.endpoint_index.remove(&node.endpoint);
        Some(node)
    }

    /// Number of discovered (live) peers - the beacon's peer count hint.
    pub fn peer_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of discovered peers we have not heard from within the timeout.
    pub fn dead_peers(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| now.duration_since(node.last_segment_received) > timeout)
            .map(|node| node.node_id)
            .collect()
    }

    /// All peers with outbound state to advance: discovered nodes first, then the
    ///  statically configured ones.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.nodes.values_mut().chain(self.static_nodes.values_mut())
    }

    pub fn static_nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.static_nodes.values_mut()
    }

    /// Drops partial reassemblies that have not seen a segment for the given
    ///  timeout - their sender has evidently given up on them.
    pub fn prune_stale_reassemblies(&mut self, now: Instant, timeout: Duration) {
        for node in self.nodes_mut() {
            node.reassemblers.retain(|message_id, message| {
                let stale = now.duration_since(message.last_activity()) > timeout;
                if stale {
                    debug!("dropping stale partial reassembly of message {}", message_id);
                }
                !stale
            });
        }
    }
}
