//! UDP tunnel: Ethernet frames exchanged with a single peer as datagrams.

use super::{Capture, RxInfo};
use crate::protocol::ethernet::HEADER_SIZE;
use crate::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Receive buffer size; larger datagrams are truncated by the kernel.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Clones share the same socket, so one task can receive while another
/// sends.
#[derive(Debug, Clone)]
pub struct UdpTunnel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTunnel {
    pub async fn bind(bind: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        debug!(local = %socket.local_addr()?, %peer, "tunnel bound");
        Ok(Self {
            socket: Arc::new(socket),
            peer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next frame from the peer. Datagrams from anyone else, and runts
    /// shorter than an Ethernet header, are skipped.
    pub async fn recv_frame(&self, buf: &mut [u8]) -> Result<RxInfo> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            if from != self.peer {
                trace!(%from, peer = %self.peer, "datagram from unknown sender ignored");
                continue;
            }
            if len < HEADER_SIZE {
                trace!(%from, len, "runt frame ignored");
                continue;
            }
            return Ok(RxInfo { len, from });
        }
    }

    pub async fn send_frame(&self, frame: &[u8]) -> Result<usize> {
        Ok(self.socket.send_to(frame, self.peer).await?)
    }
}

impl Capture for UdpTunnel {
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<RxInfo>> + Send {
        self.recv_frame(buf)
    }

    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send {
        self.send_frame(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_exchange_with_peer() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let mut tunnel = UdpTunnel::bind(loopback(), peer.local_addr().unwrap())
            .await
            .unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();

        let frame = [0xAAu8; 60];
        peer.send_to(&frame, tunnel_addr).await.unwrap();

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let rx = tunnel.recv(&mut buf).await.unwrap();
        assert_eq!(rx.len, 60);
        assert_eq!(rx.from, peer.local_addr().unwrap());
        assert_eq!(&buf[..rx.len], &frame[..]);

        assert_eq!(tunnel.send(&[0x55u8; 42]).await.unwrap(), 42);
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 42);
        assert_eq!(from, tunnel_addr);
    }

    #[tokio::test]
    async fn test_skips_strangers_and_runts() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let stranger = UdpSocket::bind(loopback()).await.unwrap();
        let tunnel = UdpTunnel::bind(loopback(), peer.local_addr().unwrap())
            .await
            .unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();

        stranger.send_to(&[1u8; 60], tunnel_addr).await.unwrap();
        peer.send_to(&[2u8; 4], tunnel_addr).await.unwrap();
        peer.send_to(&[3u8; 64], tunnel_addr).await.unwrap();

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let rx = tunnel.recv_frame(&mut buf).await.unwrap();
        assert_eq!(rx.len, 64);
        assert_eq!(buf[0], 3);
    }
}
