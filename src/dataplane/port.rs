//! Router ports materialized on this host.

use super::routing::{Ipv4Cidr, Route};
use super::PortId;
use crate::protocol::MacAddr;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tracing::warn;

/// Static description of a router port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub id: PortId,
    pub mac: MacAddr,
    /// The router's own address on this port.
    pub address: Ipv4Addr,
    /// Whole subnet reachable behind the port; the router answers ARP for
    /// addresses in here that are not in `local_network`.
    pub network: Ipv4Cidr,
    /// Hosts actually attached to the port's segment.
    pub local_network: Ipv4Cidr,
    pub routes: Vec<Route>,
}

/// A port attached to a router together with its egress channel.
#[derive(Debug)]
pub struct LocalPort {
    config: PortConfig,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LocalPort {
    pub fn new(config: PortConfig, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { config, tx }
    }

    /// Port plus the receiving end of its egress channel.
    pub fn channel(config: PortConfig) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(config, tx), rx)
    }

    pub fn id(&self) -> PortId {
        self.config.id
    }

    pub fn mac(&self) -> MacAddr {
        self.config.mac
    }

    pub fn address(&self) -> Ipv4Addr {
        self.config.address
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn routes(&self) -> &[Route] {
        &self.config.routes
    }

    pub(crate) fn routes_mut(&mut self) -> &mut Vec<Route> {
        &mut self.config.routes
    }

    pub fn in_local_network(&self, ip: Ipv4Addr) -> bool {
        self.config.local_network.contains(ip)
    }

    /// Inside the port's network but outside its local segment.
    pub fn is_proxy_target(&self, ip: Ipv4Addr) -> bool {
        self.config.network.contains(ip) && !self.config.local_network.contains(ip)
    }

    /// Emit a frame out of this port. Returns false if the receiving side
    /// is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.tx.send(frame).is_err() {
            warn!(port = self.config.id, "egress channel closed, frame dropped");
            return false;
        }
        true
    }
}
