use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::beacon::Beacon;
use crate::config::TransportConfig;
use crate::events::{TransportEvent, TransportEventNotifier};
use crate::message::SerializedMessage;
use crate::node_directory::{HelloOutcome, NodeDirectory};
use crate::node_id::NodeId;
use crate::reassembler::ReassembledMessage;
use crate::resequencer::SequencedMessage;
use crate::segmenter::Segmenter;
use crate::send_pipeline::SendPipeline;
use crate::wire::{DataChunk, Datagram, Segment};

/// Upper bound for the wake wait, so segment emission, beacon ticks and staleness
///  checks make progress even with no new I/O.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A Retransmit request names at most this many segments; beyond that a full resend
///  via Timeout is cheaper than enumerating the gaps.
const MAX_RETRANSMIT_SEGMENTS: usize = 64;

/// One raw datagram as it came off a socket, before any parsing.
pub struct InboundDatagram {
    pub bytes: Bytes,
    pub sender_endpoint: SocketAddr,
}

/// One application message queued for transmission. The nil recipient means
///  "everyone": the message is fanned out to the multicast group and to every
///  statically configured peer.
pub struct OutboundMessage {
    pub message: Arc<SerializedMessage>,
    pub recipient: NodeId,
    pub ordered: bool,
}

/// The orchestrating worker: the single owner and only writer of all per-peer state.
///  Socket readers and application senders never touch that state - they push onto
///  the inbound/outbound queues, and this loop drains them.
pub struct MessageProcessor {
    config: Arc<TransportConfig>,
    local_node_id: NodeId,
    directory: NodeDirectory,
    beacon: Beacon,
    send_pipeline: Arc<SendPipeline>,
    events: Arc<TransportEventNotifier>,
    /// fan-out transfers addressed to the multicast group, by message id
    multicast_segmenters: FxHashMap<i32, Segmenter>,
    next_message_id: i32,
    next_sequence_by_recipient: FxHashMap<NodeId, u64>,
}

impl MessageProcessor {
    pub fn new(
        config: Arc<TransportConfig>,
        local_node_id: NodeId,
        send_pipeline: Arc<SendPipeline>,
        events: Arc<TransportEventNotifier>,
    ) -> MessageProcessor {
        let now = Instant::now();
        MessageProcessor {
            local_node_id,
            directory: NodeDirectory::new(&config.static_peers, now),
            beacon: Beacon::new(local_node_id, config.beacon_interval, now),
            send_pipeline,
            events,
            multicast_segmenters: FxHashMap::default(),
            next_message_id: 0,
            next_sequence_by_recipient: FxHashMap::default(),
            config,
        }
    }

    /// The run loop: wait for work (or the poll timeout), drain both queues
    ///  completely, then do one maintenance pass. Shutdown is cooperative via the
    ///  stop signal; a Bye goes out so peers need not wait for the dead timeout.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundDatagram>,
        mut outbound: mpsc::Receiver<OutboundMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("message processor running as {:?}", self.local_node_id);

        let mut poll = time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    // Err means the stop handle was dropped without an orderly
                    //  shutdown - exit rather than spin on a closed channel
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = inbound.recv() => match received {
                    Some(datagram) => self.on_inbound_datagram(datagram).await,
                    None => break,
                },
                enqueued = outbound.recv() => match enqueued {
                    Some(message) => self.on_outbound_message(message),
                    None => break,
                },
                _ = poll.tick() => {}
            }

            while let Ok(datagram) = inbound.try_recv() {
                self.on_inbound_datagram(datagram).await;
            }
            while let Ok(message) = outbound.try_recv() {
                self.on_outbound_message(message);
            }

            self.maintain().await;
        }

        let bye = self.beacon.make_bye();
        self.send_pipeline
            .send(SocketAddr::V4(self.config.multicast_endpoint), &bye)
            .await;
        info!("message processor stopped");
    }

    async fn on_inbound_datagram(&mut self, raw: InboundDatagram) {
        let now = Instant::now();

        let mut buf: &[u8] = &raw.bytes;
        let datagram = match Datagram::deser(&mut buf) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping undecodable datagram from {:?}: {}", raw.sender_endpoint, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", datagram, raw.sender_endpoint);

        if datagram.sender == self.local_node_id {
            trace!("own datagram looped back - ignoring");
            return;
        }
        if datagram.sender.is_nil() {
            debug!("datagram with nil sender from {:?} - ignoring", raw.sender_endpoint);
            return;
        }
        if !datagram.recipient.is_nil() && datagram.recipient != self.local_node_id {
            trace!("datagram addressed to {:?} - ignoring", datagram.recipient);
            return;
        }

        let sender = datagram.sender;
        let endpoint = raw.sender_endpoint;

        match datagram.segment {
            Segment::Hello { node_id } => self.on_hello(node_id, endpoint, now),
            Segment::Data(chunk) => self.on_data(sender, endpoint, chunk, now).await,
            Segment::Acknowledge { message_id } => self.on_acknowledge(sender, endpoint, message_id, now),
            Segment::Bye { node_id } => self.on_bye(sender, node_id),
            Segment::Abort { message_id } => self.on_abort(sender, endpoint, message_id, now),
            Segment::Timeout { message_id } => self.on_timeout(sender, endpoint, message_id, now),
            Segment::Retransmit { message_id, segments } => {
                self.on_retransmit(sender, endpoint, message_id, &segments, now)
            }
        }
    }

    fn on_hello(&mut self, node_id: NodeId, endpoint: SocketAddr, now: Instant) {
        if node_id.is_nil() {
            debug!("Hello announcing the nil id from {:?} - ignoring", endpoint);
            return;
        }

        match self.directory.on_hello(node_id, endpoint, now) {
            HelloOutcome::Discovered => {
                info!("discovered {:?} at {:?}", node_id, endpoint);
                self.events
                    .send_event(TransportEvent::NodeDiscovered { node_id, endpoint });
            }
            HelloOutcome::Refreshed => {}
            HelloOutcome::Restarted { previous } => {
                info!("{:?} at {:?} restarted (was {:?})", node_id, endpoint, previous);
                self.events.send_event(TransportEvent::NodeLost { node_id: previous });
                self.events
                    .send_event(TransportEvent::NodeDiscovered { node_id, endpoint });
            }
        }
    }

    async fn on_data(&mut self, sender: NodeId, endpoint: SocketAddr, chunk: DataChunk, now: Instant) {
        let local_node_id = self.local_node_id;
        let pipeline = self.send_pipeline.clone();
        let events = self.events.clone();
        let max_ahead = self.config.max_resequence_ahead;

        let (node, newly_discovered) = self.directory.get_or_insert(sender, endpoint, now);
        if newly_discovered {
            debug!("first traffic from {:?} at {:?}", sender, endpoint);
            events.send_event(TransportEvent::NodeDiscovered { node_id: sender, endpoint });
        }

        let message_id = chunk.message_id;

        if node.was_delivered(message_id) {
            // our Acknowledge may have been lost - answer again so the sender stops
            trace!("late segment for already delivered message {} - re-acknowledging", message_id);
            pipeline
                .send(endpoint, &Datagram::new(local_node_id, sender, Segment::Acknowledge { message_id }))
                .await;
            return;
        }

        if chunk.sequence > 0 {
            if chunk.sequence < node.resequencer.next_expected_sequence() {
                debug!(
                    "stale resend of already released sequence {} from {:?} - discarding",
                    chunk.sequence, sender
                );
                return;
            }
            if !node.resequencer.accepts(chunk.sequence, max_ahead) {
                debug!(
                    "sequence {} from {:?} is too far ahead of the release point - leaving it to retransmission",
                    chunk.sequence, sender
                );
                return;
            }
        }

        match node.reassemblers.entry(message_id) {
            Entry::Occupied(mut e) => {
                e.get_mut()
                    .reassemble(chunk.segment_number, chunk.segment_offset, &chunk.payload, now)
            }
            Entry::Vacant(e) => {
                e.insert(ReassembledMessage::from_first_chunk(&chunk, endpoint, now));
            }
        }

        if !node.reassemblers.get(&message_id).is_some_and(|m| m.is_complete()) {
            return;
        }

        let message = node.reassemblers.remove(&message_id).expect("was just inserted");
        node.record_delivered(message_id);

        pipeline
            .send(endpoint, &Datagram::new(local_node_id, sender, Segment::Acknowledge { message_id }))
            .await;

        let sequence = message.sequence();
        let payload = message.into_payload();

        if sequence == 0 {
            events.send_event(TransportEvent::MessageReceived { sender, payload });
        } else if node.resequencer.resequence(SequencedMessage { sequence, payload }) {
            while let Some(released) = node.resequencer.pop() {
                events.send_event(TransportEvent::MessageReceived {
                    sender,
                    payload: released.payload,
                });
            }
        }
    }

    fn on_acknowledge(&mut self, sender: NodeId, endpoint: SocketAddr, message_id: i32, now: Instant) {
        if let Some(node) = self.directory.resolve_mut(&sender, endpoint) {
            node.last_segment_received = now;
            if node.segmenters.remove(&message_id).is_none() {
                trace!("Acknowledge for unknown message {} from {:?} - ignoring", message_id, sender);
            }
        }
    }

    fn on_abort(&mut self, sender: NodeId, endpoint: SocketAddr, message_id: i32, now: Instant) {
        if let Some(node) = self.directory.resolve_mut(&sender, endpoint) {
            node.last_segment_received = now;
            if node.segmenters.remove(&message_id).is_some() {
                debug!("{:?} aborted message {} we were sending", sender, message_id);
            }
            if node.reassemblers.remove(&message_id).is_some() {
                debug!("{:?} aborted message {} it was sending", sender, message_id);
            }
        }
    }

    fn on_bye(&mut self, sender: NodeId, announced: NodeId) {
        if announced != sender {
            debug!("Bye announcing {:?} but sent by {:?} - ignoring", announced, sender);
            return;
        }
        if self.directory.remove(&announced).is_some() {
            info!("{:?} said goodbye", announced);
            self.events.send_event(TransportEvent::NodeLost { node_id: announced });
        }
    }

    fn on_timeout(&mut self, sender: NodeId, endpoint: SocketAddr, message_id: i32, now: Instant) {
        if let Some(node) = self.directory.resolve_mut(&sender, endpoint) {
            node.last_segment_received = now;
            match node.segmenters.get_mut(&message_id) {
                Some(segmenter) => {
                    debug!("{:?} reported a timeout for message {} - full resend", sender, message_id);
                    segmenter.mark_all_for_retransmission();
                }
                None => trace!("Timeout for unknown message {} from {:?} - ignoring", message_id, sender),
            }
        }
    }

    fn on_retransmit(
        &mut self,
        sender: NodeId,
        endpoint: SocketAddr,
        message_id: i32,
        segments: &[u16],
        now: Instant,
    ) {
        if let Some(node) = self.directory.resolve_mut(&sender, endpoint) {
            node.last_segment_received = now;
            match node.segmenters.get_mut(&message_id) {
                Some(segmenter) => {
                    debug!(
                        "{:?} requested retransmission of segments {:?} of message {}",
                        sender, segments, message_id
                    );
                    segmenter.mark_for_retransmission(segments);
                }
                None => trace!("Retransmit for unknown message {} from {:?} - ignoring", message_id, sender),
            }
        }
    }

    fn on_outbound_message(&mut self, outbound: OutboundMessage) {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let segment_size = self.config.segment_size;

        if outbound.recipient.is_nil() {
            trace!("fanning out message {} to the multicast group and all static peers", message_id);
            self.multicast_segmenters
                .insert(message_id, Segmenter::new(outbound.message.clone(), segment_size, 0));
            for node in self.directory.static_nodes_mut() {
                node.segmenters
                    .insert(message_id, Segmenter::new(outbound.message.clone(), segment_size, 0));
            }
        } else if let Some(node) = self.directory.get_mut(&outbound.recipient) {
            let sequence = if outbound.ordered {
                let counter = self.next_sequence_by_recipient.entry(outbound.recipient).or_insert(0);
                *counter += 1;
                *counter
            } else {
                0
            };
            node.segmenters
                .insert(message_id, Segmenter::new(outbound.message, segment_size, sequence));
        } else {
            debug!("message for unknown recipient {:?} - dropping", outbound.recipient);
        }
    }

    /// One maintenance pass: advance every segmenter, chase stalled reassemblies,
    ///  age out dead peers and stale partial messages, and run the beacon.
    async fn maintain(&mut self) {
        let now = Instant::now();
        let local_node_id = self.local_node_id;
        let pipeline = self.send_pipeline.clone();
        let multicast_endpoint = SocketAddr::V4(self.config.multicast_endpoint);

        for node in self.directory.nodes_mut() {
            // a segmenter for a peer with a known id lives until that peer
            //  acknowledges or aborts; fan-out to id-less static peers has nobody
            //  tracked to acknowledge it and is dropped once fully sent
            let keep_until_acknowledged = !node.node_id.is_nil();
            Self::advance_segmenters(
                &pipeline,
                local_node_id,
                node.node_id,
                node.endpoint,
                &mut node.segmenters,
                keep_until_acknowledged,
            )
            .await;
        }
        Self::advance_segmenters(
            &pipeline,
            local_node_id,
            NodeId::NIL,
            multicast_endpoint,
            &mut self.multicast_segmenters,
            false,
        )
        .await;

        self.request_missing_segments(now).await;
        self.directory
            .prune_stale_reassemblies(now, self.config.reassembly_timeout);

        for node_id in self.directory.dead_peers(now, self.config.dead_peer_timeout()) {
            warn!(
                "no traffic from {:?} for {:?} - removing it",
                node_id,
                self.config.dead_peer_timeout()
            );
            self.directory.remove(&node_id);
            self.events.send_event(TransportEvent::NodeLost { node_id });
        }

        self.beacon.set_peer_count_hint(self.directory.peer_count());
        if let Some(hello) = self.beacon.tick(now) {
            pipeline.send(multicast_endpoint, &hello).await;
        }
    }

    async fn advance_segmenters(
        pipeline: &SendPipeline,
        local_node_id: NodeId,
        recipient: NodeId,
        endpoint: SocketAddr,
        segmenters: &mut FxHashMap<i32, Segmenter>,
        keep_until_acknowledged: bool,
    ) {
        let mut spent = Vec::new();

        for (&message_id, segmenter) in segmenters.iter_mut() {
            segmenter.initialize();
            if segmenter.is_invalid() {
                debug!("segmenter for message {} is invalid - discarding", message_id);
                spent.push(message_id);
                continue;
            }
            if !segmenter.is_initialized() {
                // backing message is still serializing
                continue;
            }

            while let Some(pending) = segmenter.next_pending_segment() {
                let chunk = DataChunk {
                    message_id,
                    message_size: segmenter.message_size() as i64,
                    total_segments: segmenter.total_segments(),
                    segment_number: pending.segment_number,
                    segment_offset: pending.segment_offset,
                    sequence: segmenter.sequence(),
                    payload: pending.payload,
                };
                let datagram = Datagram::new(local_node_id, recipient, Segment::Data(chunk));

                if pipeline.send(endpoint, &datagram).await {
                    segmenter.mark_sent(pending.segment_number);
                } else {
                    // transient send failure: the segment stays pending and this
                    //  segmenter is retried on the next pass
                    break;
                }
            }

            if segmenter.is_complete() && !keep_until_acknowledged {
                spent.push(message_id);
            }
        }

        for message_id in spent {
            segmenters.remove(&message_id);
        }
    }

    /// Asks senders for the gaps in reassemblies that made no progress for a while:
    ///  a Retransmit naming the missing segments, or a Timeout (full resend) when
    ///  the gap list would get too long.
    async fn request_missing_segments(&mut self, now: Instant) {
        let interval = self.config.retransmit_request_interval;
        let local_node_id = self.local_node_id;
        let pipeline = self.send_pipeline.clone();

        for node in self.directory.nodes_mut() {
            let recipient = node.node_id;
            for (&message_id, message) in node.reassemblers.iter_mut() {
                if now.duration_since(message.last_activity()) < interval {
                    continue;
                }

                // fetch one more than the limit, so exactly-at-the-limit is still
                //  distinguishable from over it
                let missing = message.missing_segments(MAX_RETRANSMIT_SEGMENTS + 1);
                let segment = if missing.len() > MAX_RETRANSMIT_SEGMENTS {
                    Segment::Timeout { message_id }
                } else {
                    Segment::Retransmit { message_id, segments: missing }
                };
                debug!(
                    "reassembly of message {} from {:?} stalled - sending {:?}",
                    message_id, recipient, segment
                );

                let datagram = Datagram::new(local_node_id, recipient, segment);
                if pipeline.send(message.sender_endpoint(), &datagram).await {
                    message.touch(now);
                }
            }
        }
    }
}
