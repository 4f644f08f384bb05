//! ARP on router ports
//!
//! Answers requests for port addresses (and proxies for the rest of a
//! port's network), learns replies into the shared cache and fans resolved
//! addresses out to everyone waiting on them. Pending resolutions are
//! driven by `Retry` and `Expire` timer tasks that re-read the cache when
//! they fire. The cache is shared, so a fired task may find an address
//! resolved (or its entry replaced) by another router; waiters are answered
//! from whatever the cache holds, and fail once their own deadline passes.

use super::arp_cache::ArpCacheEntry;
use super::router::{PendingResolution, Router};
use super::timer::{TimerKind, TimerTask};
use super::PortId;
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::{EtherType, MacAddr};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

/// Outcome of [`Router::resolve_link_address`].
#[derive(Debug)]
pub enum Resolution {
    /// Answered from the cache; `None` means the address cannot be
    /// resolved on that port.
    Ready(Option<MacAddr>),
    /// A request is in flight. Yields `None` on timeout; the channel
    /// closes if the port is detached first.
    Pending(oneshot::Receiver<Option<MacAddr>>),
}

impl Resolution {
    pub async fn wait(self) -> Option<MacAddr> {
        match self {
            Resolution::Ready(mac) => mac,
            Resolution::Pending(rx) => rx.await.ok().flatten(),
        }
    }
}

impl Router {
    /// Link address of `ip` as seen from `port_id`.
    pub fn resolve_link_address(&mut self, port_id: PortId, ip: Ipv4Addr) -> Result<Resolution> {
        let port = self
            .ports
            .get(&port_id)
            .ok_or(Error::PortNotLocal { port: port_id })?;
        if !port.in_local_network(ip) {
            debug!(port = port_id, ip = %ip, "address outside local network, not resolving");
            return Ok(Resolution::Ready(None));
        }

        let now = self.timers.now();
        if let Some(entry) = self.cache_get(ip) {
            if let Some(mac) = entry.mac {
                if !entry.is_expired(now) {
                    if entry.stale < now && entry.last_arp + self.timing.retry_ms < now {
                        debug!(port = port_id, ip = %ip, "refreshing stale entry");
                        self.send_arp_request(port_id, ip);
                    }
                    return Ok(Resolution::Ready(Some(mac)));
                }
                trace!(ip = %ip, "cached entry expired");
                self.cache_remove(ip);
            }
        }

        let (tx, rx) = oneshot::channel();
        let deadline = now + self.timing.timeout_ms;
        let pending = self
            .waiters
            .entry(port_id)
            .or_default()
            .entry(ip)
            .or_insert_with(|| PendingResolution {
                deadline,
                waiters: Vec::new(),
            });
        pending.waiters.push(tx);

        if pending.waiters.len() == 1 {
            self.send_arp_request(port_id, ip);
            let entry = ArpCacheEntry::pending(now, self.timing.timeout_ms, self.timing.retry_ms);
            self.cache_put(ip, entry);
            self.timers
                .schedule(TimerTask::retry(port_id, ip), self.timing.retry_ms);
            self.timers
                .schedule(TimerTask::expire(port_id, ip), self.timing.timeout_ms);
        }
        Ok(Resolution::Pending(rx))
    }

    /// Drop a cache entry, e.g. after an address moved.
    pub fn invalidate_arp_entry(&mut self, ip: Ipv4Addr) {
        debug!(ip = %ip, "invalidating ARP entry");
        self.cache_remove(ip);
    }

    /// Run every timer task that is due. Returns how many ran.
    pub fn run_timers(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.timers.pop_due() {
            match task.kind {
                TimerKind::Retry => self.on_retry(task.port, task.ip),
                TimerKind::Expire => self.on_expire(task.port, task.ip),
            }
            ran += 1;
        }
        ran
    }

    fn pending_deadline(&self, port_id: PortId, ip: Ipv4Addr) -> Option<u64> {
        self.waiters
            .get(&port_id)
            .and_then(|w| w.get(&ip))
            .map(|p| p.deadline)
    }

    fn on_retry(&mut self, port_id: PortId, ip: Ipv4Addr) {
        if self.pending_deadline(port_id, ip).is_none() {
            return;
        }
        let now = self.timers.now();
        match self.arp_cache.get(ip) {
            Ok(Some(entry)) if entry.mac.is_none() => {
                trace!(port = port_id, ip = %ip, "ARP retry");
                self.send_arp_request(port_id, ip);
                self.timers
                    .schedule(TimerTask::retry(port_id, ip), self.timing.retry_ms);
            }
            // learned through another router or port
            Ok(Some(ArpCacheEntry { mac: Some(mac), expiry, .. })) if expiry > now => {
                self.deliver(port_id, ip, mac);
            }
            // gone or expired: the expire task settles the waiters
            Ok(_) => {}
            Err(e) => {
                self.metrics.store_errors.inc();
                error!(ip = %ip, error = %e, "ARP cache read failed, retrying later");
                self.timers
                    .schedule(TimerTask::retry(port_id, ip), self.timing.retry_ms);
            }
        }
    }

    fn on_expire(&mut self, port_id: PortId, ip: Ipv4Addr) {
        let now = self.timers.now();
        let overdue = self
            .pending_deadline(port_id, ip)
            .is_some_and(|deadline| deadline <= now);
        match self.arp_cache.get(ip) {
            Ok(Some(entry)) if !entry.is_expired(now) => match entry.mac {
                Some(mac) => self.deliver(port_id, ip, mac),
                // another resolution cycle owns the entry
                None if overdue => self.fail_waiters(port_id, ip),
                None => {}
            },
            Ok(_) => {
                self.cache_remove(ip);
                if overdue {
                    self.fail_waiters(port_id, ip);
                }
            }
            Err(e) => {
                self.metrics.store_errors.inc();
                error!(ip = %ip, error = %e, "ARP cache read failed, re-checking expiration later");
                self.timers
                    .schedule(TimerTask::expire(port_id, ip), self.timing.retry_ms);
            }
        }
    }

    fn fail_waiters(&mut self, port_id: PortId, ip: Ipv4Addr) {
        let Some(pending) = self.waiters.get_mut(&port_id).and_then(|w| w.remove(&ip)) else {
            return;
        };
        debug!(port = port_id, ip = %ip, waiters = pending.waiters.len(), "ARP resolution timed out");
        self.metrics.arp_resolutions_failed.inc();
        for tx in pending.waiters {
            let _ = tx.send(None);
        }
    }

    fn deliver(&mut self, port_id: PortId, ip: Ipv4Addr, mac: MacAddr) {
        let Some(pending) = self.waiters.get_mut(&port_id).and_then(|w| w.remove(&ip)) else {
            return;
        };
        debug!(port = port_id, ip = %ip, mac = %mac, waiters = pending.waiters.len(), "ARP resolved");
        for tx in pending.waiters {
            let _ = tx.send(Some(mac));
        }
    }

    /// Handle an ARP frame received on `in_port`.
    pub(super) fn process_arp(&mut self, in_port: PortId, packet: &[u8]) {
        let Ok(frame) = Frame::parse(packet) else {
            return;
        };
        let arp = match ArpPacket::parse(frame.payload()) {
            Ok(arp) => arp,
            Err(e) => {
                debug!(port = in_port, "ignoring ARP frame: {}", e);
                return;
            }
        };
        if !self.ports.contains_key(&in_port) {
            warn!(port = in_port, "ARP received on a port not attached here");
            return;
        }

        match arp.operation {
            ArpOp::Request => self.process_arp_request(in_port, frame.dst_mac(), &arp),
            ArpOp::Reply => self.process_arp_reply(in_port, &arp),
        }
    }

    fn process_arp_request(&mut self, in_port: PortId, dst_mac: MacAddr, arp: &ArpPacket) {
        let Some(port) = self.ports.get(&in_port) else {
            return;
        };
        if !dst_mac.is_multicast() && dst_mac != port.mac() {
            trace!(port = in_port, dst = %dst_mac, "ARP request not for us");
            return;
        }
        // own address always answered, no conflict detection
        if arp.target_ip != port.address() && !port.is_proxy_target(arp.target_ip) {
            return;
        }

        let reply = ArpPacket::reply(port.mac(), arp.target_ip, arp.sender_mac, arp.sender_ip);
        let frame = FrameBuilder::new()
            .dst_mac(arp.sender_mac)
            .src_mac(port.mac())
            .ethertype(EtherType::Arp as u16)
            .payload(&reply.to_bytes())
            .build();

        debug!("Sending ARP reply for {} to {} on port {}", arp.target_ip, arp.sender_ip, in_port);
        if port.send(frame) {
            self.metrics.arp_replies_sent.inc();
        }
    }

    fn process_arp_reply(&mut self, in_port: PortId, arp: &ArpPacket) {
        let Some(port) = self.ports.get(&in_port) else {
            return;
        };
        if arp.target_ip != port.address() || arp.target_mac != port.mac() {
            trace!(port = in_port, target = %arp.target_ip, "ARP reply not for us");
            return;
        }

        let now = self.timers.now();
        let entry = ArpCacheEntry::resolved(
            arp.sender_mac,
            now,
            self.timing.expiration_ms,
            self.timing.stale_ms,
        );
        self.cache_put(arp.sender_ip, entry);
        self.timers.schedule(
            TimerTask::expire(in_port, arp.sender_ip),
            self.timing.expiration_ms,
        );
        self.deliver(in_port, arp.sender_ip, arp.sender_mac);
    }

    /// Broadcast a who-has for `ip` out of `port_id` and stamp the cache
    /// entry, if any, with the send time.
    fn send_arp_request(&mut self, port_id: PortId, ip: Ipv4Addr) {
        let Some(port) = self.ports.get(&port_id) else {
            warn!(port = port_id, ip = %ip, "cannot send ARP request, port not attached");
            return;
        };

        let request = ArpPacket::request(port.mac(), port.address(), ip);
        let frame = FrameBuilder::new()
            .dst_mac(MacAddr::BROADCAST)
            .src_mac(port.mac())
            .ethertype(EtherType::Arp as u16)
            .payload(&request.to_bytes())
            .build();

        debug!("Sending ARP request for {} on port {}", ip, port_id);
        if port.send(frame) {
            self.metrics.arp_requests_sent.inc();
        }

        if let Some(mut entry) = self.cache_get(ip) {
            entry.last_arp = self.timers.now();
            self.cache_put(ip, entry);
        }
    }

    fn cache_get(&self, ip: Ipv4Addr) -> Option<ArpCacheEntry> {
        match self.arp_cache.get(ip) {
            Ok(entry) => entry,
            Err(e) => {
                self.metrics.store_errors.inc();
                error!(ip = %ip, error = %e, "ARP cache read failed");
                None
            }
        }
    }

    fn cache_put(&self, ip: Ipv4Addr, entry: ArpCacheEntry) {
        if let Err(e) = self.arp_cache.put(ip, entry) {
            self.metrics.store_errors.inc();
            error!(ip = %ip, error = %e, "ARP cache write failed");
        }
    }

    fn cache_remove(&self, ip: Ipv4Addr) {
        if let Err(e) = self.arp_cache.remove(ip) {
            self.metrics.store_errors.inc();
            error!(ip = %ip, error = %e, "ARP cache remove failed");
        }
    }
}
