use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::wire::Datagram;

/// Abstraction for putting one datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// Returns false on failure. Sends never block the caller beyond the socket's
    ///  own buffer handling, and a failure is never fatal - the segment concerned
    ///  simply stays pending.
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> bool;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> bool {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        match self.send_to(buf, to).await {
            Ok(_) => true,
            Err(e) => {
                warn!("error sending UDP datagram to {:?}: {}", to, e);
                false
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Serializes datagrams and hands them to the socket.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Returns false if the datagram could not be sent; the caller decides whether
    ///  to leave the corresponding state pending for a retry.
    pub async fn send(&self, to: SocketAddr, datagram: &Datagram) -> bool {
        let mut buf = BytesMut::with_capacity(1100);
        datagram.ser(&mut buf);
        self.socket.send_datagram(to, &buf).await
    }
}
