use crate::dataplane::{PortId, RuleAction};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("port {port} is not a local port of this router")]
    PortNotLocal { port: PortId },

    #[error("chain {chain} returned {action:?}, expected ACCEPT, DROP or REJECT")]
    InvalidVerdict { chain: String, action: RuleAction },

    #[error("shared store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of the shared (multi-router) stores: the ARP cache and the
/// routing table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("entry not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;
