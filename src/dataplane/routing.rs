//! Routing table shared by the routers on a host.

use super::{FlowMatch, PortId};
use crate::StoreError;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

/// Gateway sentinel: deliver straight to the packet's destination.
pub const NO_GATEWAY: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

pub(crate) fn prefix_to_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len.min(32))
    }
}

/// Whether `addr` lies inside `network/prefix_len`.
pub fn is_in_network(addr: Ipv4Addr, network: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = prefix_to_mask(prefix_len);
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

/// IPv4 prefix such as 10.0.1.0/24. Host bits are cleared on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub const ANY: Ipv4Cidr = Ipv4Cidr {
        addr: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & prefix_to_mask(prefix_len)),
            prefix_len,
        }
    }

    /// Parse "a.b.c.d/len". A bare address is taken as a /32.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: Ipv4Addr = addr.trim().parse().ok()?;
                let prefix_len: u8 = len.trim().parse().ok()?;
                if prefix_len > 32 {
                    return None;
                }
                Some(Self::new(addr, prefix_len))
            }
            None => Some(Self::new(s.trim().parse().ok()?, 32)),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        is_in_network(addr, self.addr, self.prefix_len)
    }

    /// Whether every address of `other` is also inside `self`.
    pub fn covers(&self, other: &Ipv4Cidr) -> bool {
        self.prefix_len <= other.prefix_len && self.contains(other.addr)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NextHop {
    /// Out of `next_hop_port`.
    #[default]
    Port,
    /// Drop silently.
    Blackhole,
    /// Drop and let the caller signal unreachability.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
    pub src_network: Ipv4Addr,
    pub src_prefix_len: u8,
    pub dst_network: Ipv4Addr,
    pub dst_prefix_len: u8,
    pub next_hop: NextHop,
    pub next_hop_port: Option<PortId>,
    pub next_hop_gateway: Ipv4Addr,
    /// Lower wins among routes with the same prefix lengths.
    pub weight: u32,
}

impl Route {
    /// Route to `dst` out of `port`, from any source, no gateway.
    pub fn via_port(dst: Ipv4Cidr, port: PortId) -> Self {
        Self {
            src_network: Ipv4Addr::UNSPECIFIED,
            src_prefix_len: 0,
            dst_network: dst.network(),
            dst_prefix_len: dst.prefix_len(),
            next_hop: NextHop::Port,
            next_hop_port: Some(port),
            next_hop_gateway: NO_GATEWAY,
            weight: 100,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.next_hop_gateway = gateway;
        self
    }

    pub fn with_source(mut self, src: Ipv4Cidr) -> Self {
        self.src_network = src.network();
        self.src_prefix_len = src.prefix_len();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn matches(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        is_in_network(dst, self.dst_network, self.dst_prefix_len)
            && is_in_network(src, self.src_network, self.src_prefix_len)
    }
}

/// Route store consulted by the forwarding pipeline.
pub trait RouteTable: Send + Sync {
    /// Best route for the flow's source and destination addresses.
    fn lookup(&self, flow: &FlowMatch) -> Option<Route>;
    fn add_route(&self, route: Route) -> Result<(), StoreError>;
    /// Fails with [`StoreError::NotFound`] when the route is absent.
    fn remove_route(&self, route: &Route) -> Result<(), StoreError>;
}

/// Longest-prefix-match table; clones share the same routes.
#[derive(Debug, Clone, Default)]
pub struct SharedRoutingTable {
    routes: Arc<RwLock<Vec<Route>>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("routing table lock poisoned".into())
}

impl SharedRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current routes, most specific first.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.routes.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RouteTable for SharedRoutingTable {
    fn lookup(&self, flow: &FlowMatch) -> Option<Route> {
        let routes = self.routes.read().ok()?;
        routes
            .iter()
            .find(|r| r.matches(flow.nw_src, flow.nw_dst))
            .cloned()
    }

    fn add_route(&self, route: Route) -> Result<(), StoreError> {
        let mut routes = self.routes.write().map_err(poisoned)?;
        if routes.contains(&route) {
            return Ok(());
        }
        routes.push(route);
        routes.sort_by(|a, b| {
            b.dst_prefix_len
                .cmp(&a.dst_prefix_len)
                .then(b.src_prefix_len.cmp(&a.src_prefix_len))
                .then(a.weight.cmp(&b.weight))
        });
        Ok(())
    }

    fn remove_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut routes = self.routes.write().map_err(poisoned)?;
        let pos = routes
            .iter()
            .position(|r| r == route)
            .ok_or(StoreError::NotFound)?;
        routes.remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        Ipv4Cidr::parse(s).unwrap()
    }

    fn flow(src: [u8; 4], dst: [u8; 4]) -> FlowMatch {
        FlowMatch {
            nw_src: Ipv4Addr::from(src),
            nw_dst: Ipv4Addr::from(dst),
            ..FlowMatch::default()
        }
    }

    #[test]
    fn test_cidr_parse() {
        let c = cidr("10.0.1.77/24");
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(c.prefix_len(), 24);
        assert_eq!(c.to_string(), "10.0.1.0/24");
        assert!(c.contains(Ipv4Addr::new(10, 0, 1, 200)));
        assert!(!c.contains(Ipv4Addr::new(10, 0, 2, 1)));

        assert_eq!(cidr("10.0.0.1").prefix_len(), 32);
        assert!(Ipv4Cidr::parse("10.0.0.0/33").is_none());
        assert!(Ipv4Cidr::parse("10.0.0/8").is_none());
        assert!(Ipv4Cidr::ANY.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_cidr_covers() {
        assert!(cidr("10.0.0.0/16").covers(&cidr("10.0.1.0/24")));
        assert!(!cidr("10.0.1.0/24").covers(&cidr("10.0.0.0/16")));
        assert!(!cidr("10.1.0.0/16").covers(&cidr("10.0.1.0/24")));
    }

    #[test]
    fn test_longest_prefix_match() {
        let table = SharedRoutingTable::new();
        table
            .add_route(Route::via_port(cidr("0.0.0.0/0"), 1).with_gateway(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        table.add_route(Route::via_port(cidr("10.0.2.0/24"), 2)).unwrap();

        let route = table.lookup(&flow([10, 0, 1, 5], [10, 0, 2, 9])).unwrap();
        assert_eq!(route.next_hop_port, Some(2));

        let route = table.lookup(&flow([10, 0, 1, 5], [8, 8, 8, 8])).unwrap();
        assert_eq!(route.next_hop_port, Some(1));
        assert_eq!(route.next_hop_gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_source_restricted_route() {
        let table = SharedRoutingTable::new();
        table
            .add_route(Route::via_port(cidr("10.0.2.0/24"), 2).with_source(cidr("10.0.1.0/24")))
            .unwrap();

        assert!(table.lookup(&flow([10, 0, 1, 5], [10, 0, 2, 9])).is_some());
        assert!(table.lookup(&flow([10, 0, 3, 5], [10, 0, 2, 9])).is_none());
    }

    #[test]
    fn test_weight_breaks_ties() {
        let table = SharedRoutingTable::new();
        table
            .add_route(Route::via_port(cidr("10.0.2.0/24"), 3).with_weight(200))
            .unwrap();
        table
            .add_route(Route::via_port(cidr("10.0.2.0/24"), 4).with_weight(50))
            .unwrap();

        let route = table.lookup(&flow([1, 1, 1, 1], [10, 0, 2, 9])).unwrap();
        assert_eq!(route.next_hop_port, Some(4));
    }

    #[test]
    fn test_add_is_idempotent_and_remove_reports_absence() {
        let table = SharedRoutingTable::new();
        let route = Route::via_port(cidr("10.0.2.0/24"), 2);

        table.add_route(route.clone()).unwrap();
        table.add_route(route.clone()).unwrap();
        assert_eq!(table.len(), 1);

        table.remove_route(&route).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.remove_route(&route), Err(StoreError::NotFound));
    }

    #[test]
    fn test_clones_share_routes() {
        let table = SharedRoutingTable::new();
        let other = table.clone();
        other.add_route(Route::via_port(cidr("10.0.2.0/24"), 2)).unwrap();
        assert_eq!(table.routes().len(), 1);
    }
}
