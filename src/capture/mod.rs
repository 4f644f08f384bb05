//! Frame I/O backends
//!
//! A port's Ethernet frames travel over a UDP tunnel, one frame per
//! datagram.

mod udp;

pub use udp::{UdpTunnel, MAX_FRAME_SIZE};

use crate::Result;
use std::future::Future;
use std::net::SocketAddr;

/// Information about a received frame
#[derive(Debug, Clone)]
pub struct RxInfo {
    /// Number of bytes received
    pub len: usize,
    /// Sender of the datagram
    pub from: SocketAddr,
}

/// Frame I/O backend trait
pub trait Capture: Send + Sync {
    /// Receive a frame into the provided buffer
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<RxInfo>> + Send;

    /// Send a frame
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send;
}
