//! ARP cache shared by every router on the host.
//!
//! Keyed by IPv4 address only. An entry with `mac == None` marks a
//! resolution in flight; whoever wrote it is responsible for retrying.

use crate::protocol::MacAddr;
use crate::StoreError;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

/// Timestamps are milliseconds from the router's [`Clock`](super::Clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArpCacheEntry {
    pub mac: Option<MacAddr>,
    pub expiry: u64,
    pub stale: u64,
    pub last_arp: u64,
}

impl ArpCacheEntry {
    /// Placeholder written when the first request for an address goes out.
    pub fn pending(now: u64, timeout: u64, retry: u64) -> Self {
        Self {
            mac: None,
            expiry: now + timeout,
            stale: now + retry,
            last_arp: now,
        }
    }

    /// Entry written from an ARP reply.
    pub fn resolved(mac: MacAddr, now: u64, expiration: u64, stale: u64) -> Self {
        Self {
            mac: Some(mac),
            expiry: now + expiration,
            stale: now + stale,
            last_arp: 0,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }
}

/// Backing store for ARP entries. Every call may fail; callers log and
/// carry on.
pub trait ArpCache: Send + Sync {
    fn get(&self, ip: Ipv4Addr) -> Result<Option<ArpCacheEntry>, StoreError>;
    fn put(&self, ip: Ipv4Addr, entry: ArpCacheEntry) -> Result<(), StoreError>;
    fn remove(&self, ip: Ipv4Addr) -> Result<(), StoreError>;
}

/// In-memory cache; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct SharedArpCache {
    entries: Arc<RwLock<HashMap<Ipv4Addr, ArpCacheEntry>>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("ARP cache lock poisoned".into())
}

impl SharedArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArpCache for SharedArpCache {
    fn get(&self, ip: Ipv4Addr) -> Result<Option<ArpCacheEntry>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&ip).copied())
    }

    fn put(&self, ip: Ipv4Addr, entry: ArpCacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(ip, entry);
        Ok(())
    }

    fn remove(&self, ip: Ipv4Addr) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(&ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let cache = SharedArpCache::new();
        let ip = Ipv4Addr::new(10, 0, 1, 5);
        let mac = MacAddr([0x02, 0, 0, 0, 0, 0x05]);

        assert_eq!(cache.get(ip).unwrap(), None);

        cache
            .put(ip, ArpCacheEntry::resolved(mac, 1_000, 3_600_000, 1_800_000))
            .unwrap();
        let entry = cache.get(ip).unwrap().unwrap();
        assert_eq!(entry.mac, Some(mac));
        assert_eq!(entry.expiry, 3_601_000);
        assert_eq!(entry.stale, 1_801_000);
        assert_eq!(entry.last_arp, 0);

        cache.remove(ip).unwrap();
        assert!(cache.is_empty());
        // removing twice is fine
        cache.remove(ip).unwrap();
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = SharedArpCache::new();
        let other = cache.clone();
        let ip = Ipv4Addr::new(10, 0, 1, 6);

        other.put(ip, ArpCacheEntry::pending(0, 60_000, 10_000)).unwrap();

        let entry = cache.get(ip).unwrap().unwrap();
        assert_eq!(entry.mac, None);
        assert_eq!(entry.expiry, 60_000);
        assert_eq!(entry.stale, 10_000);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_is_expired_boundary() {
        let entry = ArpCacheEntry::pending(0, 60_000, 10_000);
        assert!(!entry.is_expired(59_999));
        assert!(entry.is_expired(60_000));
    }
}
