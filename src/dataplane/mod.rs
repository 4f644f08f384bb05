//! Data plane components
//!
//! The per-router forwarding pipeline and the ARP machinery behind it,
//! plus the stores shared between routers.

mod arp_cache;
mod arp_processor;
mod flow_match;
mod port;
mod router;
mod routing;
mod rules;
mod timer;

/// Port identifier, unique across the host.
pub type PortId = u32;

pub use arp_cache::{ArpCache, ArpCacheEntry, SharedArpCache};
pub use arp_processor::Resolution;
pub use flow_match::FlowMatch;
pub use port::{LocalPort, PortConfig};
pub use router::{
    ArpTiming, ForwardAction, ForwardInfo, PortSnapshot, Router, RouterId, RouterSnapshot,
    FLOW_IDLE_MS,
};
pub use routing::{
    is_in_network, Ipv4Cidr, NextHop, Route, RouteTable, SharedRoutingTable, NO_GATEWAY,
};
pub use rules::{
    ChainRuleEngine, PortRange, Rule, RuleAction, RuleCondition, RuleEngine, RuleResult,
    POST_ROUTING, PRE_ROUTING,
};
pub use timer::{Clock, ManualClock, SystemClock, TimerKind, TimerService, TimerTask};
