use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

/// All knobs of the transport, passed in at construction time. The transport consumes
///  this configuration but does not own loading it - wiring it up from files or
///  settings UIs is the caller's concern.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local endpoint for unicast traffic. Port 0 lets the OS pick one.
    pub unicast_endpoint: SocketAddr,

    /// Multicast group that beacons and wildcard messages are sent to. All nodes of
    ///  one mesh must agree on this.
    pub multicast_endpoint: SocketAddrV4,

    /// TTL for outgoing multicast datagrams - 1 keeps them in the local subnet.
    pub multicast_ttl: u32,

    /// Peers that are addressed explicitly rather than discovered, for networks
    ///  where multicast is filtered (e.g. across subnets).
    pub static_peers: Vec<SocketAddr>,

    /// Payload bytes per data segment.
    ///
    /// With this at 1024 the full datagram stays well below typical MTUs, so the
    ///  protocol never relies on IP-level fragmentation.
    pub segment_size: usize,

    /// Interval between Hello announcements on the multicast group.
    pub beacon_interval: Duration,

    /// A peer that stays silent for `dead_peer_multiplier * beacon_interval` is
    ///  considered dead and removed from the directory.
    pub dead_peer_multiplier: u32,

    /// Partial reassembly buffers with no new segment for this long are discarded.
    pub reassembly_timeout: Duration,

    /// How long a partial reassembly may sit without progress before the receiver
    ///  asks the sender for the missing segments.
    pub retransmit_request_interval: Duration,

    /// Upper bound for how far ahead of the next expected sequence a sender may run
    ///  before ordered messages are refused (and left to retransmission).
    pub max_resequence_ahead: usize,

    /// Capacity of the inbound raw-datagram queue feeding the processor.
    pub inbound_queue_capacity: usize,

    /// Capacity of the outbound message queue feeding the processor.
    pub outbound_queue_capacity: usize,
}

impl TransportConfig {
    pub fn new(unicast_endpoint: SocketAddr, multicast_endpoint: SocketAddrV4) -> TransportConfig {
        TransportConfig {
            unicast_endpoint,
            multicast_endpoint,
            multicast_ttl: 1,
            static_peers: Vec::new(),
            segment_size: 1024,
            beacon_interval: Duration::from_secs(1),
            dead_peer_multiplier: 5,
            reassembly_timeout: Duration::from_secs(30),
            retransmit_request_interval: Duration::from_millis(500),
            max_resequence_ahead: 1024,
            inbound_queue_capacity: 4096,
            outbound_queue_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.segment_size == 0 || self.segment_size > 1024 {
            bail!("segment size must be between 1 and 1024 bytes");
        }
        if !self.multicast_endpoint.ip().is_multicast() {
            bail!("{} is not a multicast address", self.multicast_endpoint.ip());
        }
        if self.beacon_interval.is_zero() {
            bail!("beacon interval must not be zero");
        }
        if self.dead_peer_multiplier == 0 {
            bail!("dead peer multiplier must not be zero");
        }
        if self.inbound_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            bail!("queue capacities must not be zero");
        }
        Ok(())
    }

    /// Silence threshold after which a peer is treated as dead.
    pub fn dead_peer_timeout(&self) -> Duration {
        self.beacon_interval * self.dead_peer_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn valid_config() -> TransportConfig {
        TransportConfig::new(
            SocketAddr::from_str("0.0.0.0:0").unwrap(),
            SocketAddrV4::from_str("230.0.0.1:6666").unwrap(),
        )
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_segment_size() {
        let mut config = valid_config();
        config.segment_size = 0;
        assert!(config.validate().is_err());
        config.segment_size = 1025;
        assert!(config.validate().is_err());
        config.segment_size = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multicast_addr() {
        let mut config = valid_config();
        config.multicast_endpoint = SocketAddrV4::from_str("192.168.1.1:6666").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_intervals() {
        let mut config = valid_config();
        config.beacon_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.dead_peer_multiplier = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dead_peer_timeout() {
        let mut config = valid_config();
        config.beacon_interval = Duration::from_secs(2);
        config.dead_peer_multiplier = 5;
        assert_eq!(config.dead_peer_timeout(), Duration::from_secs(10));
    }
}
