use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::result::QuicheResult;

/// The UDP datagram I/O facility the `Engine` drives (§1, §4.6, §6): a
/// single bound socket shared across every connection the engine
/// multiplexes, mirroring the teacher's `tokio::net::UdpSocket` usage but
/// generalized from one socket per connection to one socket routed by CID /
/// 4-tuple (§4.6: "Engine... owning the UDP I/O facility").
pub struct DatagramIo {
    socket: UdpSocket,
}

impl DatagramIo {
    pub async fn bind(addr: SocketAddr) -> QuicheResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub async fn send(&self, buf: &[u8], dst: SocketAddr) -> QuicheResult<usize> {
        Ok(self.socket.send_to(buf, dst).await?)
    }

    pub async fn receive(&self, buf: &mut [u8]) -> QuicheResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    pub fn local_addr(&self) -> QuicheResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// This engine does not perform PMTUD, so every path reports the same
    /// conservative datagram ceiling.
    pub fn mtu(&self, _path: SocketAddr) -> usize {
        crate::packet::codec::MAX_DATAGRAM_SIZE
    }
}
