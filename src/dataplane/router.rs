//! Per-router forwarding pipeline
//!
//! A `Router` owns its attached ports and the waiters of in-flight ARP
//! resolutions. The ARP cache and routing table are shared with the other
//! routers on the host and only reached through their traits. All methods
//! take `&mut self`; callers drive a router from a single task.

use super::arp_cache::ArpCache;
use super::port::LocalPort;
use super::routing::{Ipv4Cidr, NextHop, Route, RouteTable, NO_GATEWAY};
use super::rules::{RuleAction, RuleEngine, POST_ROUTING, PRE_ROUTING};
use super::timer::{Clock, TimerService};
use super::{FlowMatch, PortId};
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::icmp::{build_echo_reply, IcmpPacket};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Header, Protocol};
use crate::protocol::{EtherType, MacAddr};
use crate::telemetry::{MetricsSnapshot, RouterMetrics};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

pub type RouterId = u32;

/// Callers waiting on one address, and when this router gives up on it.
#[derive(Debug)]
pub(super) struct PendingResolution {
    pub(super) deadline: u64,
    pub(super) waiters: Vec<oneshot::Sender<Option<MacAddr>>>,
}

pub(super) type Waiters = HashMap<Ipv4Addr, PendingResolution>;

/// Idle time after which a tracked flow is forgotten.
pub const FLOW_IDLE_MS: u64 = 300_000;

/// ARP timing, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArpTiming {
    /// Delay between requests while a resolution is pending, and the
    /// minimum gap between stale refreshes.
    pub retry_ms: u64,
    /// How long a resolution may stay pending before waiters fail.
    pub timeout_ms: u64,
    /// Lifetime of a resolved entry.
    pub expiration_ms: u64,
    /// Age after which a resolved entry is refreshed on use.
    pub stale_ms: u64,
}

impl Default for ArpTiming {
    fn default() -> Self {
        Self {
            retry_ms: 10_000,
            timeout_ms: 60_000,
            expiration_ms: 3_600_000,
            stale_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardAction {
    /// Neither IPv4 nor ARP.
    NotIpv4,
    NoRoute,
    Forward,
    Blackhole,
    Reject,
    /// Handled by the router itself (ARP, traffic to a port address).
    Consumed,
}

/// One packet's trip through [`Router::process`].
///
/// `out_port`, `next_hop_addr` and `match_out` are only set when the
/// action is [`ForwardAction::Forward`].
#[derive(Debug, Clone)]
pub struct ForwardInfo {
    pub in_port: PortId,
    /// Ethernet frame as received.
    pub packet: Vec<u8>,
    /// Match of the packet as received.
    pub flow_match: FlowMatch,
    /// Match the pre-routing chain starts from.
    pub match_in: FlowMatch,
    pub action: Option<ForwardAction>,
    pub out_port: Option<PortId>,
    pub next_hop_addr: Option<Ipv4Addr>,
    pub match_out: Option<FlowMatch>,
    pub track_connection: bool,
}

impl ForwardInfo {
    pub fn new(in_port: PortId, packet: Vec<u8>) -> Result<Self> {
        let flow_match = FlowMatch::from_frame(&packet)?;
        Ok(Self {
            in_port,
            packet,
            flow_match,
            match_in: flow_match,
            action: None,
            out_port: None,
            next_hop_addr: None,
            match_out: None,
            track_connection: false,
        })
    }

    fn reset(&mut self) {
        self.action = None;
        self.out_port = None;
        self.next_hop_addr = None;
        self.match_out = None;
        self.track_connection = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSnapshot {
    pub id: PortId,
    pub mac: MacAddr,
    pub address: Ipv4Addr,
    pub network: Ipv4Cidr,
    pub local_network: Ipv4Cidr,
    pub routes: usize,
    /// Addresses with outstanding resolutions on this port.
    pub pending: Vec<Ipv4Addr>,
}

/// Read-only view of a router for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterSnapshot {
    pub id: RouterId,
    pub pending_timers: usize,
    pub metrics: MetricsSnapshot,
    pub ports: Vec<PortSnapshot>,
}

pub struct Router {
    pub(super) id: RouterId,
    pub(super) ports: HashMap<PortId, LocalPort>,
    pub(super) waiters: HashMap<PortId, Waiters>,
    pub(super) arp_cache: Arc<dyn ArpCache>,
    pub(super) route_table: Arc<dyn RouteTable>,
    pub(super) rules: Box<dyn RuleEngine>,
    pub(super) timers: TimerService,
    pub(super) timing: ArpTiming,
    pub(super) metrics: Arc<RouterMetrics>,
    /// Tracked flows by original match, with the time last seen.
    flows: HashMap<FlowMatch, u64>,
    flow_idle_ms: u64,
}

impl Router {
    pub fn new(
        id: RouterId,
        arp_cache: Arc<dyn ArpCache>,
        route_table: Arc<dyn RouteTable>,
        rules: Box<dyn RuleEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            ports: HashMap::new(),
            waiters: HashMap::new(),
            arp_cache,
            route_table,
            rules,
            timers: TimerService::new(clock),
            timing: ArpTiming::default(),
            metrics: Arc::new(RouterMetrics::new()),
            flows: HashMap::new(),
            flow_idle_ms: FLOW_IDLE_MS,
        }
    }

    pub fn with_flow_idle(mut self, idle_ms: u64) -> Self {
        self.flow_idle_ms = idle_ms;
        self
    }

    pub fn with_arp_timing(mut self, timing: ArpTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn port(&self, id: PortId) -> Option<&LocalPort> {
        self.ports.get(&id)
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self.ports.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run one packet through the pipeline.
    ///
    /// On success exactly one action is set. An invalid chain verdict is
    /// returned as an error and leaves no action behind.
    pub fn process(&mut self, fwd: &mut ForwardInfo) -> Result<()> {
        fwd.reset();
        self.metrics.packets_processed.inc();

        let action = self.decide(fwd)?;
        fwd.action = Some(action);
        self.count(action);
        trace!(router = self.id, in_port = fwd.in_port, ?action, "packet processed");
        Ok(())
    }

    fn decide(&mut self, fwd: &mut ForwardInfo) -> Result<ForwardAction> {
        if fwd.flow_match.dl_type == EtherType::Arp as u16 {
            self.process_arp(fwd.in_port, &fwd.packet);
            return Ok(ForwardAction::Consumed);
        }
        if fwd.flow_match.dl_type != EtherType::Ipv4 as u16 {
            return Ok(ForwardAction::NotIpv4);
        }

        if let Some(port) = self.ports.get(&fwd.in_port) {
            if fwd.flow_match.nw_dst == port.address() {
                self.process_local(fwd.in_port, &fwd.packet);
                return Ok(ForwardAction::Consumed);
            }
        }

        let pre = self.rules.apply_chain(
            PRE_ROUTING,
            &fwd.flow_match,
            fwd.match_in,
            fwd.in_port,
            None,
        );
        if pre.track_connection {
            self.touch_flow(&fwd.flow_match);
        }
        match check_verdict(PRE_ROUTING, pre.action)? {
            RuleAction::Drop => return Ok(ForwardAction::Blackhole),
            RuleAction::Reject => return Ok(ForwardAction::Reject),
            _ => {}
        }
        fwd.track_connection = pre.track_connection;

        let route = match self.route_table.lookup(&pre.flow_match) {
            Some(route) => route,
            None => {
                debug!(router = self.id, dst = %pre.flow_match.nw_dst, "no route");
                return Ok(ForwardAction::NoRoute);
            }
        };
        let out_port = match (route.next_hop, route.next_hop_port) {
            (NextHop::Blackhole, _) => return Ok(ForwardAction::Blackhole),
            (NextHop::Reject, _) => return Ok(ForwardAction::Reject),
            (NextHop::Port, Some(port)) => port,
            (NextHop::Port, None) => {
                error!(router = self.id, ?route, "port route without a port, dropping");
                return Ok(ForwardAction::Blackhole);
            }
        };

        let post = self.rules.apply_chain(
            POST_ROUTING,
            &fwd.flow_match,
            pre.flow_match,
            fwd.in_port,
            Some(out_port),
        );
        if post.track_connection {
            self.touch_flow(&fwd.flow_match);
        }
        match check_verdict(POST_ROUTING, post.action)? {
            RuleAction::Drop => return Ok(ForwardAction::Blackhole),
            RuleAction::Reject => return Ok(ForwardAction::Reject),
            _ => {}
        }
        fwd.track_connection |= post.track_connection;

        fwd.out_port = Some(out_port);
        fwd.next_hop_addr = Some(if route.next_hop_gateway == NO_GATEWAY {
            post.flow_match.nw_dst
        } else {
            route.next_hop_gateway
        });
        fwd.match_out = Some(post.flow_match);
        Ok(ForwardAction::Forward)
    }

    fn count(&self, action: ForwardAction) {
        let counter = match action {
            ForwardAction::NotIpv4 => &self.metrics.not_ipv4,
            ForwardAction::NoRoute => &self.metrics.no_route,
            ForwardAction::Forward => &self.metrics.forwarded,
            ForwardAction::Blackhole => &self.metrics.blackholed,
            ForwardAction::Reject => &self.metrics.rejected,
            ForwardAction::Consumed => &self.metrics.consumed,
        };
        counter.inc();
    }

    /// Traffic addressed to one of our ports. Only echo requests get an
    /// answer; everything else is swallowed.
    fn process_local(&mut self, in_port: PortId, packet: &[u8]) {
        let Ok(frame) = Frame::parse(packet) else {
            return;
        };
        let Ok(ip) = Ipv4Header::parse(frame.payload()) else {
            debug!(port = in_port, "malformed IPv4 packet to local address");
            return;
        };
        if Protocol::from_u8(ip.protocol()) != Some(Protocol::Icmp) {
            trace!(port = in_port, proto = ip.protocol(), "dropping non-ICMP local packet");
            return;
        }
        let Ok(icmp) = IcmpPacket::parse(ip.payload()) else {
            return;
        };
        if !icmp.is_echo_request() {
            return;
        }
        if !icmp.validate_checksum() {
            debug!(port = in_port, src = %ip.src_addr(), "bad ICMP checksum, echo request dropped");
            return;
        }
        let Some(port) = self.ports.get(&in_port) else {
            return;
        };

        let reply = Ipv4Builder::new()
            .src_addr(port.address())
            .dst_addr(ip.src_addr())
            .protocol(Protocol::Icmp as u8)
            .payload(&build_echo_reply(&icmp))
            .build();
        let frame = FrameBuilder::new()
            .dst_mac(frame.src_mac())
            .src_mac(port.mac())
            .ethertype(EtherType::Ipv4 as u16)
            .payload(&reply)
            .build();

        debug!("Sending ICMP echo reply to {} from port {}", ip.src_addr(), in_port);
        if port.send(frame) {
            self.metrics.icmp_echo_replies.inc();
        }
    }

    /// Attach a port and publish its routes. Re-attaching an id first
    /// detaches the previous port.
    pub fn add_port(&mut self, port: LocalPort) {
        let id = port.id();
        if self.ports.contains_key(&id) {
            warn!(router = self.id, port = id, "port already attached, replacing");
            self.remove_port(id);
        }

        for route in port.routes() {
            self.insert_route(route.clone());
        }
        self.waiters.insert(id, Waiters::new());
        debug!(router = self.id, port = id, mac = %port.mac(), addr = %port.address(), "port attached");
        self.ports.insert(id, port);
    }

    /// Detach a port, withdraw its routes and abandon its waiters.
    pub fn remove_port(&mut self, id: PortId) -> Option<LocalPort> {
        let port = self.ports.remove(&id)?;
        for route in port.routes() {
            self.delete_route(route);
        }
        if let Some(waiters) = self.waiters.remove(&id) {
            let abandoned: usize = waiters.values().map(|p| p.waiters.len()).sum();
            if abandoned > 0 {
                debug!(router = self.id, port = id, abandoned, "dropping pending resolutions");
            }
        }
        debug!(router = self.id, port = id, "port detached");
        Some(port)
    }

    /// Route change notification from an attached port.
    pub fn routes_changed(&mut self, id: PortId, added: &[Route], removed: &[Route]) {
        let Some(port) = self.ports.get_mut(&id) else {
            warn!(router = self.id, port = id, "route change for unknown port ignored");
            return;
        };

        let routes = port.routes_mut();
        for route in added {
            if !routes.contains(route) {
                routes.push(route.clone());
            }
        }
        routes.retain(|r| !removed.contains(r));

        for route in added {
            self.insert_route(route.clone());
        }
        for route in removed {
            self.delete_route(route);
        }
    }

    fn insert_route(&self, route: Route) {
        if let Err(e) = self.route_table.add_route(route) {
            self.metrics.store_errors.inc();
            error!(router = self.id, error = %e, "failed to add route");
        }
    }

    fn delete_route(&self, route: &Route) {
        match self.route_table.remove_route(route) {
            Ok(()) => {}
            Err(crate::StoreError::NotFound) => {
                warn!(router = self.id, ?route, "route already absent");
            }
            Err(e) => {
                self.metrics.store_errors.inc();
                error!(router = self.id, error = %e, "failed to remove route");
            }
        }
    }

    /// Let the rule engine drop per-flow state.
    pub fn free_flow_resources(&mut self, flow_match: &FlowMatch) {
        self.flows.remove(flow_match);
        self.rules.free_flow_resources(flow_match);
    }

    fn touch_flow(&mut self, flow_match: &FlowMatch) {
        let now = self.timers.now();
        self.flows.insert(*flow_match, now);
    }

    /// Free every tracked flow idle for longer than the flow timeout.
    /// Returns how many were freed.
    pub fn expire_flows(&mut self) -> usize {
        let now = self.timers.now();
        let idle = self.flow_idle_ms;
        let expired: Vec<FlowMatch> = self
            .flows
            .iter()
            .filter(|(_, seen)| seen.saturating_add(idle) <= now)
            .map(|(m, _)| *m)
            .collect();
        for flow_match in &expired {
            self.free_flow_resources(flow_match);
        }
        if !expired.is_empty() {
            debug!(router = self.id, expired = expired.len(), "idle flows expired");
        }
        expired.len()
    }

    pub fn tracked_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let ports = self
            .port_ids()
            .into_iter()
            .filter_map(|id| self.ports.get(&id))
            .map(|port| {
                let mut pending: Vec<Ipv4Addr> = self
                    .waiters
                    .get(&port.id())
                    .map(|w| w.keys().copied().collect())
                    .unwrap_or_default();
                pending.sort_unstable();
                PortSnapshot {
                    id: port.id(),
                    mac: port.mac(),
                    address: port.address(),
                    network: port.config().network,
                    local_network: port.config().local_network,
                    routes: port.routes().len(),
                    pending,
                }
            })
            .collect();

        RouterSnapshot {
            id: self.id,
            pending_timers: self.timers.len(),
            metrics: self.metrics.snapshot(),
            ports,
        }
    }
}

fn check_verdict(chain: &str, action: RuleAction) -> Result<RuleAction> {
    if action.is_verdict() {
        Ok(action)
    } else {
        Err(Error::InvalidVerdict {
            chain: chain.to_string(),
            action,
        })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("ports", &self.port_ids())
            .field("timers", &self.timers)
            .field("timing", &self.timing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{
        ChainRuleEngine, LocalPort, ManualClock, PortConfig, Rule, SharedArpCache,
        SharedRoutingTable,
    };
    use crate::protocol::icmp::build_echo_request;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PORT_A: PortId = 1;
    const PORT_B: PortId = 2;
    const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);
    const HOST_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x55]);

    fn cidr(s: &str) -> Ipv4Cidr {
        Ipv4Cidr::parse(s).unwrap()
    }

    fn port_config(id: PortId, mac: MacAddr, third: u8) -> PortConfig {
        let local = cidr(&format!("10.0.{}.0/24", third));
        PortConfig {
            id,
            mac,
            address: Ipv4Addr::new(10, 0, third, 1),
            network: local,
            local_network: local,
            routes: vec![Route::via_port(local, id)],
        }
    }

    struct Fixture {
        router: Router,
        clock: ManualClock,
        table: SharedRoutingTable,
        rx_a: UnboundedReceiver<Vec<u8>>,
        _rx_b: UnboundedReceiver<Vec<u8>>,
    }

    fn fixture(rules: impl RuleEngine + 'static) -> Fixture {
        let clock = ManualClock::new(1_000);
        let table = SharedRoutingTable::new();
        let mut router = Router::new(
            7,
            Arc::new(SharedArpCache::new()),
            Arc::new(table.clone()),
            Box::new(rules),
            Arc::new(clock.clone()),
        );
        let (a, rx_a) = LocalPort::channel(port_config(PORT_A, MAC_A, 1));
        let (b, rx_b) = LocalPort::channel(port_config(PORT_B, MAC_B, 2));
        router.add_port(a);
        router.add_port(b);
        Fixture {
            router,
            clock,
            table,
            rx_a,
            _rx_b: rx_b,
        }
    }

    fn ipv4_frame(dst_mac: MacAddr, dst: Ipv4Addr, protocol: u8, l4: &[u8]) -> Vec<u8> {
        let ip = Ipv4Builder::new()
            .protocol(protocol)
            .src_addr(Ipv4Addr::new(10, 0, 1, 5))
            .dst_addr(dst)
            .payload(l4)
            .build();
        FrameBuilder::new()
            .dst_mac(dst_mac)
            .src_mac(HOST_MAC)
            .ethertype(EtherType::Ipv4 as u16)
            .payload(&ip)
            .build()
    }

    fn udp_to(dst: Ipv4Addr) -> ForwardInfo {
        let frame = ipv4_frame(MAC_A, dst, 17, &[0x30, 0x39, 0x00, 0x35, 0, 8, 0, 0]);
        ForwardInfo::new(PORT_A, frame).unwrap()
    }

    fn assert_no_forward_fields(fwd: &ForwardInfo) {
        assert_eq!(fwd.out_port, None);
        assert_eq!(fwd.next_hop_addr, None);
        assert_eq!(fwd.match_out, None);
    }

    #[test]
    fn test_forward_direct() {
        let mut fx = fixture(ChainRuleEngine::new());
        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));

        fx.router.process(&mut fwd).unwrap();

        assert_eq!(fwd.action, Some(ForwardAction::Forward));
        assert_eq!(fwd.out_port, Some(PORT_B));
        assert_eq!(fwd.next_hop_addr, Some(Ipv4Addr::new(10, 0, 2, 9)));
        assert_eq!(fwd.match_out, Some(fwd.flow_match));
        assert!(!fwd.track_connection);
        assert_eq!(fx.router.metrics().forwarded.get(), 1);
    }

    #[test]
    fn test_forward_via_gateway() {
        let mut fx = fixture(ChainRuleEngine::new());
        fx.table
            .add_route(
                Route::via_port(Ipv4Cidr::ANY, PORT_B).with_gateway(Ipv4Addr::new(10, 0, 2, 254)),
            )
            .unwrap();

        let mut fwd = udp_to(Ipv4Addr::new(8, 8, 8, 8));
        fx.router.process(&mut fwd).unwrap();

        assert_eq!(fwd.action, Some(ForwardAction::Forward));
        assert_eq!(fwd.next_hop_addr, Some(Ipv4Addr::new(10, 0, 2, 254)));
    }

    #[test]
    fn test_no_route() {
        let mut fx = fixture(ChainRuleEngine::new());
        let mut fwd = udp_to(Ipv4Addr::new(192, 0, 2, 1));

        fx.router.process(&mut fwd).unwrap();

        assert_eq!(fwd.action, Some(ForwardAction::NoRoute));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_not_ipv4() {
        let mut fx = fixture(ChainRuleEngine::new());
        let frame = FrameBuilder::new()
            .dst_mac(MAC_A)
            .src_mac(HOST_MAC)
            .ethertype(EtherType::Ipv6 as u16)
            .payload(&[0u8; 40])
            .build();
        let mut fwd = ForwardInfo::new(PORT_A, frame).unwrap();

        fx.router.process(&mut fwd).unwrap();

        assert_eq!(fwd.action, Some(ForwardAction::NotIpv4));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_pre_routing_drop_and_reject() {
        let mut rules = ChainRuleEngine::new();
        let mut drop = Rule::new(RuleAction::Drop);
        drop.condition.dst = Some(cidr("10.0.2.9/32"));
        rules.add_rule(PRE_ROUTING, drop);
        let mut reject = Rule::new(RuleAction::Reject);
        reject.condition.dst = Some(cidr("10.0.2.10/32"));
        rules.add_rule(PRE_ROUTING, reject);
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Blackhole));
        assert_no_forward_fields(&fwd);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 10));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Reject));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_post_routing_sees_out_port() {
        let mut rules = ChainRuleEngine::new();
        let mut deny_b = Rule::new(RuleAction::Reject);
        deny_b.condition.out_port = Some(PORT_B);
        rules.add_rule(POST_ROUTING, deny_b);
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Reject));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_route_lookup_uses_rewritten_match() {
        let mut rules = ChainRuleEngine::new();
        let mut dnat = Rule::new(RuleAction::Accept);
        dnat.condition.dst = Some(cidr("192.0.2.10/32"));
        dnat.set_nw_dst = Some(Ipv4Addr::new(10, 0, 2, 9));
        dnat.track_connection = true;
        rules.add_rule(PRE_ROUTING, dnat);
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(192, 0, 2, 10));
        fx.router.process(&mut fwd).unwrap();

        assert_eq!(fwd.action, Some(ForwardAction::Forward));
        assert_eq!(fwd.out_port, Some(PORT_B));
        assert_eq!(fwd.next_hop_addr, Some(Ipv4Addr::new(10, 0, 2, 9)));
        assert_eq!(fwd.flow_match.nw_dst, Ipv4Addr::new(192, 0, 2, 10));
        assert!(fwd.track_connection);
    }

    #[test]
    fn test_invalid_verdict_is_an_error() {
        let mut rules = ChainRuleEngine::new();
        rules.add_rule(PRE_ROUTING, Rule::new(RuleAction::Jump));
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        match fx.router.process(&mut fwd) {
            Err(Error::InvalidVerdict { chain, action }) => {
                assert_eq!(chain, PRE_ROUTING);
                assert_eq!(action, RuleAction::Jump);
            }
            other => panic!("Expected InvalidVerdict, got {:?}", other),
        }
        assert_eq!(fwd.action, None);
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_blackhole_and_reject_routes() {
        let mut fx = fixture(ChainRuleEngine::new());
        let mut hole = Route::via_port(cidr("172.16.0.0/12"), PORT_B);
        hole.next_hop = NextHop::Blackhole;
        fx.table.add_route(hole).unwrap();
        let mut reject = Route::via_port(cidr("192.168.0.0/16"), PORT_B);
        reject.next_hop = NextHop::Reject;
        fx.table.add_route(reject).unwrap();
        let mut broken = Route::via_port(cidr("198.51.100.0/24"), PORT_B);
        broken.next_hop_port = None;
        fx.table.add_route(broken).unwrap();

        let mut fwd = udp_to(Ipv4Addr::new(172, 16, 0, 1));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Blackhole));

        let mut fwd = udp_to(Ipv4Addr::new(192, 168, 1, 1));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Reject));

        let mut fwd = udp_to(Ipv4Addr::new(198, 51, 100, 1));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Blackhole));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_echo_request_to_port_address() {
        let mut fx = fixture(ChainRuleEngine::new());
        let ping = build_echo_request(0x77, 2, b"abcd");
        let frame = ipv4_frame(MAC_A, Ipv4Addr::new(10, 0, 1, 1), 1, &ping);
        let mut fwd = ForwardInfo::new(PORT_A, frame).unwrap();

        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Consumed));
        assert_no_forward_fields(&fwd);

        let out = fx.rx_a.try_recv().unwrap();
        assert!(fx.rx_a.try_recv().is_err());

        let eth = Frame::parse(&out).unwrap();
        assert_eq!(eth.dst_mac(), HOST_MAC);
        assert_eq!(eth.src_mac(), MAC_A);
        let ip = Ipv4Header::parse(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(10, 0, 1, 5));
        let icmp = IcmpPacket::parse(ip.payload()).unwrap();
        assert_eq!(icmp.icmp_type(), 0);
        assert_eq!(icmp.identifier(), 0x77);
        assert_eq!(icmp.sequence(), 2);
        assert_eq!(icmp.payload(), b"abcd");
        assert_eq!(fx.router.metrics().icmp_echo_replies.get(), 1);
    }

    #[test]
    fn test_corrupt_echo_request_ignored() {
        let mut fx = fixture(ChainRuleEngine::new());
        let mut ping = build_echo_request(0x77, 2, b"abcd");
        ping[2] ^= 0xFF;
        let frame = ipv4_frame(MAC_A, Ipv4Addr::new(10, 0, 1, 1), 1, &ping);
        let mut fwd = ForwardInfo::new(PORT_A, frame).unwrap();

        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Consumed));
        assert!(fx.rx_a.try_recv().is_err());
        assert_eq!(fx.router.metrics().icmp_echo_replies.get(), 0);
    }

    #[test]
    fn test_other_local_traffic_consumed_silently() {
        let mut fx = fixture(ChainRuleEngine::new());
        let frame = ipv4_frame(MAC_A, Ipv4Addr::new(10, 0, 1, 1), 17, &[0, 1, 0, 2, 0, 8, 0, 0]);
        let mut fwd = ForwardInfo::new(PORT_A, frame).unwrap();

        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Consumed));
        assert!(fx.rx_a.try_recv().is_err());
    }

    #[test]
    fn test_reprocessing_clears_previous_result() {
        let mut fx = fixture(ChainRuleEngine::new());
        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Forward));

        fx.router.remove_port(PORT_B);
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::NoRoute));
        assert_no_forward_fields(&fwd);
    }

    #[test]
    fn test_attach_detach_routes() {
        let mut fx = fixture(ChainRuleEngine::new());
        assert_eq!(fx.table.len(), 2);

        // already gone from the shared table before detach: tolerated
        let route = Route::via_port(cidr("10.0.1.0/24"), PORT_A);
        fx.table.remove_route(&route).unwrap();

        assert!(fx.router.remove_port(PORT_A).is_some());
        assert!(fx.router.remove_port(PORT_A).is_none());
        assert_eq!(fx.table.len(), 1);

        // withdrawn by a change event
        let route = Route::via_port(cidr("10.0.2.0/24"), PORT_B);
        fx.router.routes_changed(PORT_B, &[], &[route]);
        assert!(fx.table.is_empty());
        assert!(fx.router.port(PORT_B).unwrap().routes().is_empty());

        fx.router.remove_port(PORT_B);
        assert!(fx.table.is_empty());
        assert_eq!(fx.router.metrics().store_errors.get(), 0);
    }

    #[test]
    fn test_routes_changed_adds_routes() {
        let mut fx = fixture(ChainRuleEngine::new());
        let extra = Route::via_port(cidr("10.9.0.0/16"), PORT_B);

        fx.router.routes_changed(PORT_B, &[extra.clone()], &[]);
        assert_eq!(fx.table.len(), 3);
        assert!(fx.router.port(PORT_B).unwrap().routes().contains(&extra));

        // unknown port: ignored
        fx.router.routes_changed(99, &[Route::via_port(cidr("10.8.0.0/16"), 99)], &[]);
        assert_eq!(fx.table.len(), 3);

        fx.router.remove_port(PORT_B);
        assert_eq!(fx.table.len(), 1);
    }

    #[test]
    fn test_free_flow_resources_reaches_engine() {
        let mut rules = ChainRuleEngine::new();
        let mut track = Rule::new(RuleAction::Accept);
        track.track_connection = true;
        rules.add_rule(POST_ROUTING, track);
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert!(fwd.track_connection);

        // engine is behind the trait object; freeing must not disturb processing
        fx.router.free_flow_resources(&fwd.flow_match);
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Forward));
    }

    /// Tracks every flow in post-routing and records what it is told to free.
    struct RecordingEngine {
        inner: ChainRuleEngine,
        freed: Arc<std::sync::Mutex<Vec<FlowMatch>>>,
    }

    impl RuleEngine for RecordingEngine {
        fn apply_chain(
            &mut self,
            chain: &str,
            flow_match: &FlowMatch,
            current: FlowMatch,
            in_port: PortId,
            out_port: Option<PortId>,
        ) -> crate::dataplane::RuleResult {
            self.inner
                .apply_chain(chain, flow_match, current, in_port, out_port)
        }

        fn free_flow_resources(&mut self, flow_match: &FlowMatch) {
            self.freed.lock().unwrap().push(*flow_match);
        }
    }

    #[test]
    fn test_idle_tracked_flows_expire() {
        let mut inner = ChainRuleEngine::new();
        let mut track = Rule::new(RuleAction::Accept);
        track.track_connection = true;
        inner.add_rule(POST_ROUTING, track);
        let freed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut fx = fixture(RecordingEngine {
            inner,
            freed: freed.clone(),
        });
        fx.router = fx.router.with_flow_idle(1_000);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fx.router.tracked_flows(), 1);

        // traffic keeps the flow alive
        fx.clock.advance(600);
        fx.router.process(&mut fwd).unwrap();
        fx.clock.advance(600);
        assert_eq!(fx.router.expire_flows(), 0);
        assert!(freed.lock().unwrap().is_empty());

        fx.clock.advance(400);
        assert_eq!(fx.router.expire_flows(), 1);
        assert_eq!(fx.router.tracked_flows(), 0);
        assert_eq!(*freed.lock().unwrap(), vec![fwd.flow_match]);
    }

    #[test]
    fn test_dropped_tracked_flow_also_expires() {
        let mut rules = ChainRuleEngine::new();
        let mut deny = Rule::new(RuleAction::Drop);
        deny.track_connection = true;
        rules.add_rule(PRE_ROUTING, deny);
        let mut fx = fixture(rules);

        let mut fwd = udp_to(Ipv4Addr::new(10, 0, 2, 9));
        fx.router.process(&mut fwd).unwrap();
        assert_eq!(fwd.action, Some(ForwardAction::Blackhole));
        assert_eq!(fx.router.tracked_flows(), 1);

        fx.clock.advance(FLOW_IDLE_MS);
        assert_eq!(fx.router.expire_flows(), 1);
        assert_eq!(fx.router.tracked_flows(), 0);
    }

    #[test]
    fn test_snapshot() {
        let fx = fixture(ChainRuleEngine::new());
        let snap = fx.router.snapshot();

        assert_eq!(snap.id, 7);
        assert_eq!(snap.ports.len(), 2);
        assert_eq!(snap.ports[0].id, PORT_A);
        assert_eq!(snap.ports[0].mac, MAC_A);
        assert_eq!(snap.ports[0].routes, 1);
        assert!(snap.ports[0].pending.is_empty());
        assert_eq!(snap.pending_timers, 0);
    }
}
