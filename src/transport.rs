use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::TransportConfig;
use crate::events::{TransportEvent, TransportEventNotifier};
use crate::message::SerializedMessage;
use crate::node_id::NodeId;
use crate::processor::{InboundDatagram, MessageProcessor, OutboundMessage};
use crate::send_pipeline::SendPipeline;

/// The transport's outer shell: binds the sockets, runs the receive loops and the
///  processor task, and exposes the send / subscribe API.
///
/// There is no connection state to manage - `start` has the transport fully
///  operational, and peers appear as they are discovered.
pub struct UdpTransport {
    local_node_id: NodeId,
    local_addr: SocketAddr,
    events: Arc<TransportEventNotifier>,
    outbound: mpsc::Sender<OutboundMessage>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Binds the unicast and multicast sockets, joins the multicast group and starts
    ///  the worker tasks. The transport announces itself right away and is ready to
    ///  send and receive when this returns.
    pub async fn start(config: TransportConfig) -> anyhow::Result<UdpTransport> {
        config.validate()?;
        let config = Arc::new(config);
        let local_node_id = NodeId::generate();

        let unicast_socket = Arc::new(UdpSocket::bind(config.unicast_endpoint).await?);
        unicast_socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        // loopback on, so several nodes on one host can form a mesh; a node's own
        //  datagrams are filtered out by sender id
        unicast_socket.set_multicast_loop_v4(true)?;
        let local_addr = unicast_socket.local_addr()?;

        let multicast_socket = Arc::new(make_multicast_socket(config.multicast_endpoint)?);

        info!(
            "transport {:?} listening on {:?}, multicast group {:?}",
            local_node_id, local_addr, config.multicast_endpoint
        );

        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_queue_capacity);
        let (outbound_sender, outbound_receiver) = mpsc::channel(config.outbound_queue_capacity);
        let (stop_sender, stop_receiver) = watch::channel(false);

        let events = Arc::new(TransportEventNotifier::new());

        let processor = MessageProcessor::new(
            config.clone(),
            local_node_id,
            Arc::new(SendPipeline::new(Arc::new(unicast_socket.clone()))),
            events.clone(),
        );

        let tasks = vec![
            tokio::spawn(recv_loop(
                unicast_socket,
                inbound_sender.clone(),
                stop_receiver.clone(),
            )),
            tokio::spawn(recv_loop(
                multicast_socket,
                inbound_sender,
                stop_receiver.clone(),
            )),
            tokio::spawn(processor.run(inbound_receiver, outbound_receiver, stop_receiver)),
        ];

        Ok(UdpTransport {
            local_node_id,
            local_addr,
            events,
            outbound: outbound_sender,
            stop: stop_sender,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// The bound unicast endpoint - the concrete port when the configuration said 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Queues a message for delivery to one recipient, or to everyone when the
    ///  recipient is nil. Returns false if the outbound queue is full - the caller
    ///  decides whether to retry, drop, or slow down.
    pub fn send(&self, recipient: NodeId, message: Arc<SerializedMessage>) -> bool {
        self.enqueue(recipient, message, false)
    }

    /// Like `send`, but the message is tagged with a per-recipient sequence number
    ///  and released on the receiving side strictly after all earlier ordered
    ///  messages to that recipient.
    pub fn send_ordered(&self, recipient: NodeId, message: Arc<SerializedMessage>) -> bool {
        self.enqueue(recipient, message, true)
    }

    fn enqueue(&self, recipient: NodeId, message: Arc<SerializedMessage>, ordered: bool) -> bool {
        self.outbound
            .try_send(OutboundMessage { message, recipient, ordered })
            .is_ok()
    }

    /// Stops all worker tasks. The processor sends a Bye on its way out, so peers
    ///  learn of the departure without waiting for the dead timeout.
    pub async fn shutdown(self) {
        if self.stop.send(true).is_err() {
            warn!("transport workers already gone");
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("transport {:?} shut down", self.local_node_id);
    }
}

/// A UDP socket bound to the group port and joined to the multicast group. Address
///  reuse must be set before binding, so several transports on one host can all
///  listen on the same group port.
fn make_multicast_socket(group: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Reads datagrams off one socket and feeds them to the processor. When the inbound
///  queue is full the datagram is dropped - the protocol treats that like any other
///  UDP loss, and retransmission covers it.
async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::Sender<InboundDatagram>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            changed = stop.changed() => {
                // Err means the stop handle was dropped without an orderly
                //  shutdown - exit rather than spin on a closed channel
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let datagram = InboundDatagram {
                        bytes: Bytes::copy_from_slice(&buf[..len]),
                        sender_endpoint: from,
                    };
                    if inbound.try_send(datagram).is_err() {
                        warn!("inbound queue full - dropping datagram from {:?}", from);
                    }
                }
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config_with_group(group_port: u16) -> TransportConfig {
        TransportConfig::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 71, 1), group_port),
        )
    }

    async fn next_message(
        events: &mut broadcast::Receiver<TransportEvent>,
    ) -> Option<(NodeId, Bytes)> {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(TransportEvent::MessageReceived { sender, payload }) =
                    events.recv().await
                {
                    return (sender, payload);
                }
            }
        })
        .await
        .ok()
    }

    #[tokio::test]
    async fn test_start_binds_a_concrete_port_and_shuts_down() {
        let transport = UdpTransport::start(config_with_group(47101)).await.unwrap();

        assert!(!transport.node_id().is_nil());
        assert_ne!(transport.local_addr().port(), 0);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_workers_exit_when_the_stop_handle_is_dropped() {
        let transport = UdpTransport::start(config_with_group(47107)).await.unwrap();
        let UdpTransport { stop, tasks, .. } = transport;

        // no shutdown() - the stop handle just goes away
        drop(stop);

        for task in tasks {
            timeout(Duration::from_secs(5), task)
                .await
                .expect("worker kept running after the stop handle was dropped")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_two_transports_share_one_multicast_group() {
        // same group and port on one host - the group socket must allow reuse
        let first = UdpTransport::start(config_with_group(47108)).await.unwrap();
        let second = UdpTransport::start(config_with_group(47108)).await.unwrap();

        assert_ne!(first.node_id(), second.node_id());
        assert_ne!(first.local_addr(), second.local_addr());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = config_with_group(47102);
        config.segment_size = 0;
        assert!(UdpTransport::start(config).await.is_err());
    }

    #[tokio::test]
    async fn test_delivery_via_static_peer() {
        let receiver = UdpTransport::start(config_with_group(47103)).await.unwrap();
        let mut received = receiver.subscribe();

        // the sender knows the receiver only as a static endpoint - everything
        //  flows over plain unicast, no multicast required
        let mut config = config_with_group(47104);
        config.static_peers = vec![receiver.local_addr()];
        let sender = UdpTransport::start(config).await.unwrap();

        let payload: Vec<u8> = (0..2600u32).map(|i| i as u8).collect();
        assert!(sender.send(
            NodeId::NIL,
            Arc::new(SerializedMessage::from_bytes(Bytes::from(payload.clone()))),
        ));

        let (from, delivered) = next_message(&mut received).await.expect("no message arrived");
        assert_eq!(from, sender.node_id());
        assert_eq!(delivered, Bytes::from(payload));

        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_ordered_unicast_between_two_transports() {
        let receiver = UdpTransport::start(config_with_group(47105)).await.unwrap();
        let mut received = receiver.subscribe();

        let mut config = config_with_group(47106);
        config.static_peers = vec![receiver.local_addr()];
        let sender = UdpTransport::start(config).await.unwrap();

        // make the receiver known to the sender by having it answer first
        assert!(sender.send(
            NodeId::NIL,
            Arc::new(SerializedMessage::from_bytes(Bytes::from_static(b"ping"))),
        ));
        let (sender_id, _) = next_message(&mut received).await.expect("no ping arrived");

        let mut sender_events = sender.subscribe();
        assert!(receiver.send(
            sender_id,
            Arc::new(SerializedMessage::from_bytes(Bytes::from_static(b"pong"))),
        ));
        let _ = next_message(&mut sender_events).await.expect("no pong arrived");

        // now ordered messages flow receiver -> sender with known ids
        for payload in [b"first".as_slice(), b"second", b"third"] {
            assert!(receiver.send_ordered(
                sender_id,
                Arc::new(SerializedMessage::from_bytes(Bytes::copy_from_slice(payload))),
            ));
        }

        let mut delivered = Vec::new();
        for _ in 0..3 {
            let (_, payload) = next_message(&mut sender_events).await.expect("ordered message missing");
            delivered.push(payload);
        }
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::from_static(b"third"),
            ]
        );

        sender.shutdown().await;
        receiver.shutdown().await;
    }
}
