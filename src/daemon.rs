//! Datapath daemon
//!
//! Hosts the routers of a configuration on one tokio task. Frames from the
//! port tunnels come in over a channel, forwards leave through the egress
//! channel of their output port once the next hop is resolved, and ARP
//! timers fire from the same loop. Resolutions still in flight are awaited
//! in spawned tasks that hand the packet back to the loop, so routers are
//! never shared.

use crate::capture::{UdpTunnel, MAX_FRAME_SIZE};
use crate::config::{Config, TunnelConfig};
use crate::dataplane::{
    Clock, ForwardAction, ForwardInfo, LocalPort, PortId, Resolution, Router, RouterId,
    RouterSnapshot, SharedArpCache, SharedRoutingTable,
};
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::ipv4::Ipv4Packet;
use crate::protocol::{EtherType, MacAddr};
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// How often idle tracked flows are swept.
const FLOW_AGING_INTERVAL: Duration = Duration::from_secs(30);

/// Routers built from a configuration, sharing one ARP cache and one
/// routing table.
#[derive(Debug)]
pub struct Host {
    routers: BTreeMap<RouterId, Router>,
    port_owner: HashMap<PortId, RouterId>,
    egress: HashMap<PortId, mpsc::UnboundedReceiver<Vec<u8>>>,
    tunnels: HashMap<PortId, TunnelConfig>,
    arp_cache: SharedArpCache,
    route_table: SharedRoutingTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub routers: Vec<RouterSnapshot>,
}

impl Host {
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let arp_cache = SharedArpCache::new();
        let route_table = SharedRoutingTable::new();
        let mut routers = BTreeMap::new();
        let mut port_owner = HashMap::new();
        let mut egress = HashMap::new();
        let mut tunnels = HashMap::new();

        for router_config in &config.routers {
            let mut router = Router::new(
                router_config.id,
                Arc::new(arp_cache.clone()),
                Arc::new(route_table.clone()),
                Box::new(router_config.rule_engine()?),
                clock.clone(),
            )
            .with_arp_timing(config.arp);

            for entry in &router_config.ports {
                let (port, rx) = LocalPort::channel(entry.to_port_config()?);
                router.add_port(port);
                port_owner.insert(entry.id, router_config.id);
                egress.insert(entry.id, rx);
                if let Some(tunnel) = entry.tunnel {
                    tunnels.insert(entry.id, tunnel);
                }
            }
            routers.insert(router_config.id, router);
        }

        Ok(Self {
            routers,
            port_owner,
            egress,
            tunnels,
            arp_cache,
            route_table,
        })
    }

    pub fn router(&self, id: RouterId) -> Option<&Router> {
        self.routers.get(&id)
    }

    pub fn arp_cache(&self) -> &SharedArpCache {
        &self.arp_cache
    }

    pub fn route_table(&self) -> &SharedRoutingTable {
        &self.route_table
    }

    /// Receiving end of a port's egress channel. Can be taken once.
    pub fn take_egress(&mut self, port: PortId) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.egress.remove(&port)
    }

    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            routers: self.routers.values().map(Router::snapshot).collect(),
        }
    }
}

/// Forward waiting for its next hop.
#[derive(Debug)]
struct Completion {
    router: RouterId,
    out_port: PortId,
    next_hop: Ipv4Addr,
    mac: Option<MacAddr>,
    /// IPv4 packet ready to go, TTL already decremented.
    packet: Vec<u8>,
}

pub struct Daemon {
    host: Host,
    ingress_tx: mpsc::UnboundedSender<(PortId, Vec<u8>)>,
    ingress_rx: mpsc::UnboundedReceiver<(PortId, Vec<u8>)>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl Daemon {
    pub fn new(host: Host) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            host,
            ingress_tx,
            ingress_rx,
            completion_tx,
            completion_rx,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    /// Sender for frames received on a port.
    pub fn ingress(&self) -> mpsc::UnboundedSender<(PortId, Vec<u8>)> {
        self.ingress_tx.clone()
    }

    /// Bind the port tunnels and run until Ctrl-C.
    pub async fn run(mut self) -> Result<()> {
        self.start_tunnels().await?;
        info!(routers = self.host.routers.len(), "daemon running");
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
        info!("daemon stopped");
        Ok(())
    }

    async fn start_tunnels(&mut self) -> Result<()> {
        let ports: Vec<PortId> = self.host.egress.keys().copied().collect();
        for port in ports {
            let Some(mut egress) = self.host.take_egress(port) else {
                continue;
            };
            let Some(config) = self.host.tunnels.get(&port).copied() else {
                // No tunnel: frames for this port go nowhere.
                tokio::spawn(async move {
                    while let Some(frame) = egress.recv().await {
                        trace!(port, len = frame.len(), "no tunnel, frame discarded");
                    }
                });
                continue;
            };

            let tunnel = UdpTunnel::bind(config.bind, config.peer).await?;
            info!(port, bind = %config.bind, peer = %config.peer, "tunnel up");

            let sender = tunnel.clone();
            tokio::spawn(async move {
                while let Some(frame) = egress.recv().await {
                    if let Err(e) = sender.send_frame(&frame).await {
                        warn!("Failed to send on port {}: {}", port, e);
                    }
                }
            });

            let ingress = self.ingress();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_FRAME_SIZE];
                loop {
                    match tunnel.recv_frame(&mut buf).await {
                        Ok(rx) => {
                            if ingress.send((port, buf[..rx.len].to_vec())).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Receive error on port {}: {}", port, e),
                    }
                }
            });
        }
        Ok(())
    }

    /// Event loop: ingress frames, completed resolutions, ARP timers and
    /// flow ageing, until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut aging = tokio::time::interval(FLOW_AGING_INTERVAL);
        loop {
            let timer_delay = self.next_timer_delay();
            tokio::select! {
                _ = &mut shutdown => break,
                Some((port, frame)) = self.ingress_rx.recv() => {
                    self.handle_frame(port, frame);
                }
                Some(done) = self.completion_rx.recv() => {
                    self.complete(done);
                }
                _ = tokio::time::sleep(timer_delay.unwrap_or_default()), if timer_delay.is_some() => {
                    self.fire_timers();
                }
                _ = aging.tick() => {
                    self.expire_flows();
                }
            }
        }
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        self.host
            .routers
            .values()
            .filter_map(|r| r.next_timer_deadline().map(|d| d.saturating_sub(r.now())))
            .min()
            .map(Duration::from_millis)
    }

    /// Run due ARP timers on every router.
    pub fn fire_timers(&mut self) -> usize {
        self.host.routers.values_mut().map(Router::run_timers).sum()
    }

    /// Release tracked flows that have gone idle on every router.
    pub fn expire_flows(&mut self) -> usize {
        self.host.routers.values_mut().map(Router::expire_flows).sum()
    }

    /// Push one received frame through the owning router.
    pub fn handle_frame(&mut self, in_port: PortId, frame: Vec<u8>) {
        let Some(&router_id) = self.host.port_owner.get(&in_port) else {
            debug!(port = in_port, "frame on unknown port dropped");
            return;
        };
        let Some(router) = self.host.routers.get_mut(&router_id) else {
            return;
        };

        let mut fwd = match ForwardInfo::new(in_port, frame) {
            Ok(fwd) => fwd,
            Err(e) => {
                debug!(port = in_port, error = %e, "unparsable frame dropped");
                return;
            }
        };
        if let Err(e) = router.process(&mut fwd) {
            warn!(router = router_id, port = in_port, error = %e, "pipeline error, frame dropped");
            return;
        }

        match fwd.action {
            Some(ForwardAction::Forward) => {}
            Some(action) => {
                trace!(router = router_id, port = in_port, ?action, "not forwarded");
                return;
            }
            None => return,
        }
        let (Some(out_port), Some(next_hop)) = (fwd.out_port, fwd.next_hop_addr) else {
            return;
        };
        let Some(packet) = egress_packet(&fwd) else {
            return;
        };

        match router.resolve_link_address(out_port, next_hop) {
            Ok(Resolution::Ready(Some(mac))) => emit(router, out_port, mac, &packet),
            Ok(Resolution::Ready(None)) => {
                debug!(port = out_port, next_hop = %next_hop, "next hop unresolvable, dropping");
            }
            Ok(pending) => {
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let mac = pending.wait().await;
                    let _ = tx.send(Completion {
                        router: router_id,
                        out_port,
                        next_hop,
                        mac,
                        packet,
                    });
                });
            }
            Err(e) => {
                debug!(router = router_id, error = %e, "cannot resolve next hop, dropping");
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        let Some(mac) = done.mac else {
            debug!(port = done.out_port, next_hop = %done.next_hop, "resolution failed, dropping");
            return;
        };
        if let Some(router) = self.host.routers.get(&done.router) {
            emit(router, done.out_port, mac, &done.packet);
        }
    }

    /// Wait for one completed resolution and finish its forward.
    #[cfg(test)]
    async fn complete_next(&mut self) {
        if let Some(done) = self.completion_rx.recv().await {
            self.complete(done);
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").field("host", &self.host).finish()
    }
}

/// IP packet of a forward, TTL decremented and chain rewrites applied.
fn egress_packet(fwd: &ForwardInfo) -> Option<Vec<u8>> {
    let frame = Frame::parse(&fwd.packet).ok()?;
    let mut packet = Ipv4Packet::from_bytes(frame.payload()).ok()?;
    if !packet.decrement_ttl() {
        debug!(port = fwd.in_port, dst = %fwd.flow_match.nw_dst, "TTL expired, dropping");
        return None;
    }
    if let Some(out) = fwd.match_out {
        if out.nw_src != fwd.flow_match.nw_src {
            packet.set_src_addr(out.nw_src);
        }
        if out.nw_dst != fwd.flow_match.nw_dst {
            packet.set_dst_addr(out.nw_dst);
        }
    }
    Some(packet.into_bytes())
}

fn emit(router: &Router, out_port: PortId, dst_mac: MacAddr, packet: &[u8]) {
    let Some(port) = router.port(out_port) else {
        debug!(port = out_port, "output port detached, dropping");
        return;
    };
    let frame = FrameBuilder::new()
        .dst_mac(dst_mac)
        .src_mac(port.mac())
        .ethertype(EtherType::Ipv4 as u16)
        .payload(packet)
        .build();
    port.send(frame);
}
