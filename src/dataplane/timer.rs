//! Clocks and the deferred task queue driving ARP retries and expirations.
//!
//! Tasks are plain values naming a (port, address) pair. They are never
//! cancelled; a fired task re-reads the cache and decides what to do.

use super::PortId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock, milliseconds since the UNIX epoch. Cache entries written by
/// different hosts stay comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Settable clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_millis)))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    /// Re-send the request if the entry is still unresolved.
    Retry,
    /// Drop the entry and fail waiters if it has expired.
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerTask {
    pub port: PortId,
    pub ip: Ipv4Addr,
    pub kind: TimerKind,
}

impl TimerTask {
    pub fn retry(port: PortId, ip: Ipv4Addr) -> Self {
        Self {
            port,
            ip,
            kind: TimerKind::Retry,
        }
    }

    pub fn expire(port: PortId, ip: Ipv4Addr) -> Self {
        Self {
            port,
            ip,
            kind: TimerKind::Expire,
        }
    }
}

// deadline first, then insertion order
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    deadline: u64,
    seq: u64,
    task: TimerTask,
}

pub struct TimerService {
    clock: Arc<dyn Clock>,
    queue: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

impl TimerService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Run `task` once `delay_millis` have passed.
    pub fn schedule(&mut self, task: TimerTask, delay_millis: u64) {
        let deadline = self.now().saturating_add(delay_millis);
        self.queue.push(Reverse(Scheduled {
            deadline,
            seq: self.next_seq,
            task,
        }));
        self.next_seq += 1;
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse(s)| s.deadline)
    }

    /// Pop the next task whose deadline has passed.
    pub fn pop_due(&mut self) -> Option<TimerTask> {
        let now = self.now();
        match self.queue.peek() {
            Some(Reverse(s)) if s.deadline <= now => self.queue.pop().map(|Reverse(s)| s.task),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.queue.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}
