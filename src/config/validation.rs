//! Configuration validation

use super::{parse_protocol, Config, RouterConfig};
use crate::dataplane::{Ipv4Cidr, NextHop, PortRange, RuleAction, POST_ROUTING, PRE_ROUTING};
use crate::protocol::MacAddr;
use crate::telemetry::{is_known_format, is_known_level};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_log(config, &mut result);
    validate_arp(config, &mut result);
    validate_routers(config, &mut result);

    result
}

fn validate_log(config: &Config, result: &mut ValidationResult) {
    if !is_known_level(&config.log.level) {
        result.warn(format!(
            "log.level: unknown level '{}', using info",
            config.log.level
        ));
    }
    if !is_known_format(&config.log.format) {
        result.warn(format!(
            "log.format: unknown format '{}', using pretty",
            config.log.format
        ));
    }
}

fn validate_arp(config: &Config, result: &mut ValidationResult) {
    let arp = &config.arp;
    if arp.retry_ms == 0 {
        result.error("arp.retry_ms: must be greater than zero");
    }
    if arp.retry_ms >= arp.timeout_ms {
        result.error(format!(
            "arp: retry_ms ({}) must be less than timeout_ms ({})",
            arp.retry_ms, arp.timeout_ms
        ));
    }
    if arp.stale_ms > arp.expiration_ms {
        result.error(format!(
            "arp: stale_ms ({}) must not exceed expiration_ms ({})",
            arp.stale_ms, arp.expiration_ms
        ));
    }
}

fn validate_routers(config: &Config, result: &mut ValidationResult) {
    if config.routers.is_empty() {
        result.warn("routers: no routers defined");
    }

    let mut router_ids = HashSet::new();
    // Port ids are unique across the host, not per router.
    let mut port_ids = HashSet::new();
    let mut binds = HashSet::new();

    for router in &config.routers {
        if !router_ids.insert(router.id) {
            result.error(format!("routers.{}: duplicate router id", router.id));
        }

        for port in &router.ports {
            if !port_ids.insert(port.id) {
                result.error(format!(
                    "routers.{}.ports.{}: duplicate port id",
                    router.id, port.id
                ));
            }
            if let Some(tunnel) = port.tunnel {
                if !binds.insert(tunnel.bind) {
                    result.error(format!(
                        "routers.{}.ports.{}: tunnel bind {} already in use",
                        router.id, port.id, tunnel.bind
                    ));
                }
            }
        }

        validate_ports(router, result);
        validate_chains(router, result);
    }
}

fn validate_ports(router: &RouterConfig, result: &mut ValidationResult) {
    for port in &router.ports {
        let at = format!("routers.{}.ports.{}", router.id, port.id);

        match port.mac.parse::<MacAddr>() {
            Ok(mac) if mac.is_multicast() => {
                result.error(format!("{}: mac {} is a multicast address", at, mac));
            }
            Ok(_) => {}
            Err(_) => result.error(format!("{}: invalid mac '{}'", at, port.mac)),
        }

        let network = Ipv4Cidr::parse(&port.network);
        if network.is_none() {
            result.error(format!("{}: invalid network '{}'", at, port.network));
        }
        let local_network = Ipv4Cidr::parse(&port.local_network);
        if local_network.is_none() {
            result.error(format!(
                "{}: invalid local_network '{}'",
                at, port.local_network
            ));
        }

        if let Some(local) = local_network {
            if !local.contains(port.address) {
                result.error(format!(
                    "{}: address {} is outside local_network {}",
                    at, port.address, local
                ));
            }
            if let Some(network) = network {
                if !network.covers(&local) {
                    result.error(format!(
                        "{}: local_network {} is not inside network {}",
                        at, local, network
                    ));
                }
            }
        }

        if port.routes.is_empty() {
            result.warn(format!("{}: no routes, port only answers ARP and ping", at));
        }

        for (i, route) in port.routes.iter().enumerate() {
            if Ipv4Cidr::parse(&route.destination).is_none() {
                result.error(format!(
                    "{}.routes[{}]: invalid destination '{}'",
                    at, i, route.destination
                ));
            }
            if let Some(ref source) = route.source {
                if Ipv4Cidr::parse(source).is_none() {
                    result.error(format!("{}.routes[{}]: invalid source '{}'", at, i, source));
                }
            }
            if let Some(gateway) = route.gateway {
                if route.next_hop != NextHop::Port {
                    result.warn(format!(
                        "{}.routes[{}]: gateway {} ignored for {:?} route",
                        at, i, gateway, route.next_hop
                    ));
                } else if local_network.is_some_and(|l| !l.contains(gateway)) {
                    result.warn(format!(
                        "{}.routes[{}]: gateway {} is outside local_network, it will never resolve",
                        at, i, gateway
                    ));
                }
            }
        }
    }
}

fn validate_chains(router: &RouterConfig, result: &mut ValidationResult) {
    let ports: HashSet<_> = router.ports.iter().map(|p| p.id).collect();

    for (chain, rules) in &router.chains {
        if chain != PRE_ROUTING && chain != POST_ROUTING {
            result.warn(format!(
                "routers.{}.chains.{}: unknown chain, rules will never run",
                router.id, chain
            ));
        }

        for (i, rule) in rules.iter().enumerate() {
            let at = format!("routers.{}.chains.{}[{}]", router.id, chain, i);

            if matches!(rule.action, RuleAction::Jump | RuleAction::Return) {
                result.error(format!("{}: action {:?} is not supported", at, rule.action));
            }

            let protocol = match rule.protocol {
                Some(ref p) => {
                    let parsed = parse_protocol(p);
                    if parsed.is_none() {
                        result.error(format!("{}: unknown protocol '{}'", at, p));
                    }
                    parsed
                }
                None => None,
            };

            for (field, value) in [("src", &rule.src), ("dst", &rule.dst)] {
                if let Some(v) = value {
                    if Ipv4Cidr::parse(v).is_none() {
                        result.error(format!("{}: invalid {} '{}'", at, field, v));
                    }
                }
            }

            for (field, value) in [("src_port", &rule.src_port), ("dst_port", &rule.dst_port)] {
                let Some(v) = value else {
                    continue;
                };
                if PortRange::parse(v).is_none() {
                    result.error(format!("{}: invalid {} '{}'", at, field, v));
                }
                if !matches!(protocol, Some(6) | Some(17)) {
                    result.warn(format!(
                        "{}: {} only matches tcp or udp traffic",
                        at, field
                    ));
                }
            }

            for (field, value) in [("in_port", rule.in_port), ("out_port", rule.out_port)] {
                if let Some(id) = value {
                    if !ports.contains(&id) {
                        result.warn(format!("{}: {} {} is not a port of this router", at, field, id));
                    }
                }
            }

            if rule.out_port.is_some() && chain == PRE_ROUTING {
                result.warn(format!(
                    "{}: out_port is unknown before routing, rule never matches",
                    at
                ));
            }
        }
    }
}
