//! Rule chains evaluated before and after the route lookup.
//!
//! The router only sees the [`RuleEngine`] trait. [`ChainRuleEngine`] is a
//! first-match engine built from configuration.

use super::routing::Ipv4Cidr;
use super::{FlowMatch, PortId};
use crate::protocol::ipv4::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

pub const PRE_ROUTING: &str = "pre-routing";
pub const POST_ROUTING: &str = "post-routing";

/// Verdict of a rule or a whole chain. The router only accepts
/// `Accept`, `Drop` and `Reject` as the outcome of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Continue,
    Drop,
    Jump,
    Reject,
    Return,
}

impl RuleAction {
    pub fn is_verdict(&self) -> bool {
        matches!(self, RuleAction::Accept | RuleAction::Drop | RuleAction::Reject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResult {
    pub action: RuleAction,
    /// The match after any rewrites the chain performed.
    pub flow_match: FlowMatch,
    pub track_connection: bool,
}

pub trait RuleEngine: Send {
    /// Evaluate `chain` against `current`. `flow_match` is the packet as it
    /// arrived, before any rewrite.
    fn apply_chain(
        &mut self,
        chain: &str,
        flow_match: &FlowMatch,
        current: FlowMatch,
        in_port: PortId,
        out_port: Option<PortId>,
    ) -> RuleResult;

    /// Release per-flow state once the datapath forgets the flow.
    fn free_flow_resources(&mut self, _flow_match: &FlowMatch) {}
}

/// Inclusive L4 port range, "80" or "1024-65535".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start.trim().parse().ok()?;
                let end: u16 = end.trim().parse().ok()?;
                (start <= end).then(|| Self::new(start, end))
            }
            None => Some(Self::single(s.trim().parse().ok()?)),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Conditions of a rule; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleCondition {
    pub protocol: Option<u8>,
    pub src: Option<Ipv4Cidr>,
    pub dst: Option<Ipv4Cidr>,
    /// TCP/UDP only
    pub src_port: Option<PortRange>,
    /// TCP/UDP only
    pub dst_port: Option<PortRange>,
    pub in_port: Option<PortId>,
    pub out_port: Option<PortId>,
}

fn has_ports(nw_proto: u8) -> bool {
    matches!(
        Protocol::from_u8(nw_proto),
        Some(Protocol::Tcp) | Some(Protocol::Udp)
    )
}

impl RuleCondition {
    pub fn matches(&self, m: &FlowMatch, in_port: PortId, out_port: Option<PortId>) -> bool {
        if self.protocol.is_some_and(|p| p != m.nw_proto) {
            return false;
        }
        if self.src.is_some_and(|c| !c.contains(m.nw_src)) {
            return false;
        }
        if self.dst.is_some_and(|c| !c.contains(m.nw_dst)) {
            return false;
        }
        if let Some(range) = self.src_port {
            if !has_ports(m.nw_proto) || !range.contains(m.tp_src) {
                return false;
            }
        }
        if let Some(range) = self.dst_port {
            if !has_ports(m.nw_proto) || !range.contains(m.tp_dst) {
                return false;
            }
        }
        if self.in_port.is_some_and(|p| p != in_port) {
            return false;
        }
        if let Some(port) = self.out_port {
            if out_port != Some(port) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub track_connection: bool,
    /// Destination rewrite applied when the rule matches.
    pub set_nw_dst: Option<Ipv4Addr>,
    /// Source rewrite applied when the rule matches.
    pub set_nw_src: Option<Ipv4Addr>,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            condition: RuleCondition::default(),
            action,
            track_connection: false,
            set_nw_dst: None,
            set_nw_src: None,
        }
    }
}

/// First-match engine. A matching `Continue` rule applies its rewrites and
/// evaluation goes on; falling off the end of a chain (or naming a chain
/// with no rules) accepts.
#[derive(Debug, Default)]
pub struct ChainRuleEngine {
    chains: HashMap<String, Vec<Rule>>,
    tracked: HashSet<FlowMatch>,
}

impl ChainRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, chain: &str, rule: Rule) {
        self.chains.entry(chain.to_string()).or_default().push(rule);
    }

    pub fn rule_count(&self, chain: &str) -> usize {
        self.chains.get(chain).map_or(0, Vec::len)
    }

    /// Flows currently holding connection-tracking state.
    pub fn tracked_flows(&self) -> usize {
        self.tracked.len()
    }
}

impl RuleEngine for ChainRuleEngine {
    fn apply_chain(
        &mut self,
        chain: &str,
        flow_match: &FlowMatch,
        current: FlowMatch,
        in_port: PortId,
        out_port: Option<PortId>,
    ) -> RuleResult {
        let mut result = RuleResult {
            action: RuleAction::Accept,
            flow_match: current,
            track_connection: false,
        };

        let rules = match self.chains.get(chain) {
            Some(rules) => rules,
            None => return result,
        };

        for rule in rules {
            if !rule.condition.matches(&result.flow_match, in_port, out_port) {
                continue;
            }
            if let Some(dst) = rule.set_nw_dst {
                result.flow_match.nw_dst = dst;
            }
            if let Some(src) = rule.set_nw_src {
                result.flow_match.nw_src = src;
            }
            result.track_connection |= rule.track_connection;
            if rule.action != RuleAction::Continue {
                result.action = rule.action;
                break;
            }
        }

        if result.track_connection {
            self.tracked.insert(*flow_match);
        }
        result
    }

    fn free_flow_resources(&mut self, flow_match: &FlowMatch) {
        self.tracked.remove(flow_match);
    }
}
