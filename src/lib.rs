//! vrouter - virtual router forwarding engine
//!
//! Decides per packet whether a virtual router forwards, drops, rejects or
//! consumes it, resolves next-hop MAC addresses over ARP with a cache shared
//! between router instances, and mirrors the routes of locally materialized
//! ports into a shared routing table.

pub mod capture;
pub mod config;
pub mod daemon;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result, StoreError};
