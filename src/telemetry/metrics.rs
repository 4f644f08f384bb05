//! Per-router packet and ARP counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter, safe to bump from any task holding a shared reference.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters kept by each router.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Packets handed to the pipeline.
    pub packets_processed: Counter,

    // Terminal actions
    pub not_ipv4: Counter,
    pub no_route: Counter,
    pub forwarded: Counter,
    pub blackholed: Counter,
    pub rejected: Counter,
    pub consumed: Counter,

    // ARP
    pub arp_requests_sent: Counter,
    pub arp_replies_sent: Counter,
    /// Resolutions that ended without an address (timeout or detach).
    pub arp_resolutions_failed: Counter,

    pub icmp_echo_replies: Counter,

    /// Failures talking to the shared ARP cache or routing table.
    pub store_errors: Counter,
}

/// Point-in-time copy of [`RouterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_processed: u64,
    pub not_ipv4: u64,
    pub no_route: u64,
    pub forwarded: u64,
    pub blackholed: u64,
    pub rejected: u64,
    pub consumed: u64,
    pub arp_requests_sent: u64,
    pub arp_replies_sent: u64,
    pub arp_resolutions_failed: u64,
    pub icmp_echo_replies: u64,
    pub store_errors: u64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_processed: self.packets_processed.get(),
            not_ipv4: self.not_ipv4.get(),
            no_route: self.no_route.get(),
            forwarded: self.forwarded.get(),
            blackholed: self.blackholed.get(),
            rejected: self.rejected.get(),
            consumed: self.consumed.get(),
            arp_requests_sent: self.arp_requests_sent.get(),
            arp_replies_sent: self.arp_replies_sent.get(),
            arp_resolutions_failed: self.arp_resolutions_failed.get(),
            icmp_echo_replies: self.icmp_echo_replies.get(),
            store_errors: self.store_errors.get(),
        }
    }

    /// Flat name/value pairs, e.g. for a line-oriented dump.
    pub fn export(&self) -> Vec<(&'static str, u64)> {
        let s = self.snapshot();
        vec![
            ("packets_processed", s.packets_processed),
            ("not_ipv4", s.not_ipv4),
            ("no_route", s.no_route),
            ("forwarded", s.forwarded),
            ("blackholed", s.blackholed),
            ("rejected", s.rejected),
            ("consumed", s.consumed),
            ("arp_requests_sent", s.arp_requests_sent),
            ("arp_replies_sent", s.arp_replies_sent),
            ("arp_resolutions_failed", s.arp_resolutions_failed),
            ("icmp_echo_replies", s.icmp_echo_replies),
            ("store_errors", s.store_errors),
        ]
    }
}
