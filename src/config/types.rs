//! Configuration types

use crate::dataplane::{
    ArpTiming, ChainRuleEngine, Ipv4Cidr, NextHop, PortConfig, PortId, PortRange, Route,
    RouterId, Rule, RuleAction, RuleCondition,
};
use crate::protocol::ipv4::Protocol;
use crate::protocol::MacAddr;
use crate::telemetry::LogConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

/// Host configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub arp: ArpTiming,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    pub id: RouterId,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    /// Rules per chain name, evaluated in order.
    #[serde(default)]
    pub chains: BTreeMap<String, Vec<RuleConfig>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortEntry {
    pub id: PortId,
    pub mac: String,
    pub address: Ipv4Addr,
    pub network: String,
    pub local_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// UDP endpoint pair carrying the port's Ethernet frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelConfig {
    pub bind: SocketAddr,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub destination: String,
    #[serde(default)]
    pub next_hop: NextHop,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub action: RuleAction,
    /// "tcp", "udp", "icmp" or a protocol number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_port: Option<PortId>,
    #[serde(default)]
    pub track: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_dst: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_src: Option<Ipv4Addr>,
}

/// Protocol name or number as written in a rule.
pub fn parse_protocol(s: &str) -> Option<u8> {
    match s.to_ascii_lowercase().as_str() {
        "icmp" => Some(Protocol::Icmp as u8),
        "tcp" => Some(Protocol::Tcp as u8),
        "udp" => Some(Protocol::Udp as u8),
        other => other.parse().ok(),
    }
}

fn cidr(field: &str, value: &str) -> Result<Ipv4Cidr> {
    Ipv4Cidr::parse(value)
        .ok_or_else(|| Error::Config(format!("{}: invalid CIDR '{}'", field, value)))
}

impl PortEntry {
    pub fn to_port_config(&self) -> Result<PortConfig> {
        let mac: MacAddr = self
            .mac
            .parse()
            .map_err(|_| Error::Config(format!("port {}: invalid mac '{}'", self.id, self.mac)))?;
        let network = cidr(&format!("port {} network", self.id), &self.network)?;
        let local_network = cidr(&format!("port {} local_network", self.id), &self.local_network)?;
        let routes = self
            .routes
            .iter()
            .map(|r| r.to_route(self.id))
            .collect::<Result<Vec<_>>>()?;

        Ok(PortConfig {
            id: self.id,
            mac,
            address: self.address,
            network,
            local_network,
            routes,
        })
    }
}

impl RouteConfig {
    /// Route owned by `port`. Only `next_hop = "port"` routes point at it.
    pub fn to_route(&self, port: PortId) -> Result<Route> {
        let dst = cidr(&format!("port {} route destination", port), &self.destination)?;
        let mut route = Route::via_port(dst, port);
        route.next_hop = self.next_hop;
        if self.next_hop != NextHop::Port {
            route.next_hop_port = None;
        }
        if let Some(gateway) = self.gateway {
            route = route.with_gateway(gateway);
        }
        if let Some(ref source) = self.source {
            route = route.with_source(cidr(&format!("port {} route source", port), source)?);
        }
        if let Some(weight) = self.weight {
            route = route.with_weight(weight);
        }
        Ok(route)
    }
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<Rule> {
        let protocol = match self.protocol {
            Some(ref p) => Some(
                parse_protocol(p)
                    .ok_or_else(|| Error::Config(format!("rule: unknown protocol '{}'", p)))?,
            ),
            None => None,
        };
        let src = self.src.as_deref().map(|s| cidr("rule src", s)).transpose()?;
        let dst = self.dst.as_deref().map(|s| cidr("rule dst", s)).transpose()?;
        let src_port = self.src_port.as_deref().map(port_range).transpose()?;
        let dst_port = self.dst_port.as_deref().map(port_range).transpose()?;

        Ok(Rule {
            condition: RuleCondition {
                protocol,
                src,
                dst,
                src_port,
                dst_port,
                in_port: self.in_port,
                out_port: self.out_port,
            },
            action: self.action,
            track_connection: self.track,
            set_nw_dst: self.set_dst,
            set_nw_src: self.set_src,
        })
    }
}

fn port_range(s: &str) -> Result<PortRange> {
    PortRange::parse(s).ok_or_else(|| Error::Config(format!("rule: invalid port range '{}'", s)))
}

impl RouterConfig {
    pub fn rule_engine(&self) -> Result<ChainRuleEngine> {
        let mut engine = ChainRuleEngine::new();
        for (chain, rules) in &self.chains {
            for rule in rules {
                engine.add_rule(chain, rule.to_rule()?);
            }
        }
        Ok(engine)
    }
}
