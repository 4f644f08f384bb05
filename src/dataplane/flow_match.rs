//! Header fields the pipeline matches and rewrites on.

use crate::protocol::arp::ArpPacket;
use crate::protocol::ethernet::Frame;
use crate::protocol::ipv4::{Ipv4Header, Protocol};
use crate::protocol::{EtherType, MacAddr};
use crate::Result;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Flat header summary in OpenFlow 1.0 style.
///
/// For ARP frames `nw_src`/`nw_dst` hold the sender/target protocol
/// addresses and `nw_proto` the low byte of the opcode. For ICMP `tp_src`
/// and `tp_dst` hold the message type and code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowMatch {
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub dl_type: u16,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub nw_proto: u8,
    pub nw_tos: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Default for FlowMatch {
    fn default() -> Self {
        Self {
            dl_src: MacAddr::ZERO,
            dl_dst: MacAddr::ZERO,
            dl_type: 0,
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            nw_proto: 0,
            nw_tos: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

impl FlowMatch {
    /// Build a match from an Ethernet frame. Only a frame too short for an
    /// Ethernet header is an error; unparsable upper layers leave their
    /// fields zeroed.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let eth = Frame::parse(frame)?;
        let mut m = FlowMatch {
            dl_src: eth.src_mac(),
            dl_dst: eth.dst_mac(),
            dl_type: eth.ethertype(),
            ..FlowMatch::default()
        };

        if m.dl_type == EtherType::Arp as u16 {
            if let Ok(arp) = ArpPacket::parse(eth.payload()) {
                m.nw_src = arp.sender_ip;
                m.nw_dst = arp.target_ip;
                m.nw_proto = arp.operation as u8;
            }
        } else if m.dl_type == EtherType::Ipv4 as u16 {
            if let Ok(ip) = Ipv4Header::parse(eth.payload()) {
                m.nw_src = ip.src_addr();
                m.nw_dst = ip.dst_addr();
                m.nw_proto = ip.protocol();
                m.nw_tos = ip.tos();
                m.fill_transport(ip.payload());
            }
        }

        Ok(m)
    }

    fn fill_transport(&mut self, l4: &[u8]) {
        match Protocol::from_u8(self.nw_proto) {
            Some(Protocol::Tcp) | Some(Protocol::Udp) if l4.len() >= 4 => {
                self.tp_src = u16::from_be_bytes([l4[0], l4[1]]);
                self.tp_dst = u16::from_be_bytes([l4[2], l4[3]]);
            }
            Some(Protocol::Icmp) if l4.len() >= 2 => {
                self.tp_src = l4[0] as u16;
                self.tp_dst = l4[1] as u16;
            }
            _ => {}
        }
    }
}
