use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::node_id::NodeId;

/// Notifications surfaced to the message bus sitting on top of this transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A message was fully reassembled (and, if ordered, released in order).
    MessageReceived { sender: NodeId, payload: Bytes },
    NodeDiscovered { node_id: NodeId, endpoint: SocketAddr },
    NodeLost { node_id: NodeId },
}

pub struct TransportEventNotifier {
    sender: broadcast::Sender<TransportEvent>,
}

impl Default for TransportEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportEventNotifier {
    pub fn new() -> TransportEventNotifier {
        let (sender, _) = broadcast::channel(256);
        TransportEventNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: TransportEvent) {
        trace!("event: {:?}", event);
        // an error just means nobody is subscribed at the moment
        let _ = self.sender.send(event);
    }
}
