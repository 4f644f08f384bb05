//! IPv4 (RFC 791)

use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Header size without options
pub const MIN_HEADER_SIZE: usize = 20;

/// IP protocol numbers the router looks into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

fn header_len_of(buffer: &[u8]) -> Result<usize> {
    if buffer.len() < MIN_HEADER_SIZE {
        return Err(Error::Parse("IPv4 header too short".into()));
    }
    if buffer[0] >> 4 != 4 {
        return Err(Error::Parse("not an IPv4 packet".into()));
    }
    let header_len = (buffer[0] & 0x0F) as usize * 4;
    if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
        return Err(Error::Parse("IPv4 header truncated".into()));
    }
    Ok(header_len)
}

/// Borrowed view over an IPv4 header and its payload
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        let header_len = header_len_of(buffer)?;
        Ok(Self { buffer, header_len })
    }

    pub fn tos(&self) -> u8 {
        self.buffer[1]
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[12],
            self.buffer[13],
            self.buffer[14],
            self.buffer[15],
        )
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[16],
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
        )
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Payload bounded by the total length field when it is sane, so
    /// Ethernet padding is not handed to upper layers.
    pub fn payload(&self) -> &'a [u8] {
        let total = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        let end = if total >= self.header_len && total <= self.buffer.len() {
            total
        } else {
            self.buffer.len()
        };
        &self.buffer[self.header_len..end]
    }
}

/// Internet checksum (RFC 1071), shared by IPv4 and ICMP
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => u16::from_be_bytes([*hi, 0]) as u32,
            _ => 0,
        })
        .fold(0u32, u32::wrapping_add);

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Owned IPv4 packet that can be modified in place before forwarding
#[derive(Debug)]
pub struct Ipv4Packet {
    buffer: Vec<u8>,
    header_len: usize,
}

impl Ipv4Packet {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header_len = header_len_of(data)?;
        Ok(Self {
            buffer: data.to_vec(),
            header_len,
        })
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    /// Decrement TTL and fix up the header checksum.
    /// Returns false when the packet must not be forwarded (TTL <= 1).
    pub fn decrement_ttl(&mut self) -> bool {
        if self.buffer[8] <= 1 {
            return false;
        }
        self.buffer[8] -= 1;
        self.update_checksum();
        true
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buffer[12], self.buffer[13], self.buffer[14], self.buffer[15])
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buffer[16], self.buffer[17], self.buffer[18], self.buffer[19])
    }

    /// Rewrite the source address, fixing both the header and the
    /// TCP/UDP checksum.
    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.rewrite_addr(12, addr);
    }

    /// Rewrite the destination address, fixing both the header and the
    /// TCP/UDP checksum.
    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.rewrite_addr(16, addr);
    }

    fn rewrite_addr(&mut self, offset: usize, addr: Ipv4Addr) {
        let old: [u8; 4] = [
            self.buffer[offset],
            self.buffer[offset + 1],
            self.buffer[offset + 2],
            self.buffer[offset + 3],
        ];
        let new = addr.octets();
        if old == new {
            return;
        }
        self.buffer[offset..offset + 4].copy_from_slice(&new);
        self.update_checksum();

        // The pseudo header covers both addresses; only the first fragment
        // carries the L4 header.
        let fragment_offset = u16::from_be_bytes([self.buffer[6], self.buffer[7]]) & 0x1FFF;
        if fragment_offset != 0 {
            return;
        }
        let at = match Protocol::from_u8(self.buffer[9]) {
            Some(Protocol::Tcp) => self.header_len + 16,
            Some(Protocol::Udp) => self.header_len + 6,
            _ => return,
        };
        if self.buffer.len() < at + 2 {
            return;
        }
        let current = u16::from_be_bytes([self.buffer[at], self.buffer[at + 1]]);
        // UDP without checksum
        if current == 0 && self.buffer[9] == Protocol::Udp as u8 {
            return;
        }
        let mut sum = adjust_checksum(current, old, new);
        if sum == 0 && self.buffer[9] == Protocol::Udp as u8 {
            sum = 0xFFFF;
        }
        self.buffer[at..at + 2].copy_from_slice(&sum.to_be_bytes());
    }

    fn update_checksum(&mut self) {
        self.buffer[10] = 0;
        self.buffer[11] = 0;
        let sum = checksum(&self.buffer[..self.header_len]);
        self.buffer[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Incremental checksum update for a changed 32-bit field (RFC 1624).
fn adjust_checksum(sum: u16, old: [u8; 4], new: [u8; 4]) -> u16 {
    let mut acc = !sum as u32;
    for pair in old.chunks(2) {
        acc += !u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    for pair in new.chunks(2) {
        acc += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

/// Builder for option-less IPv4 packets
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    tos: u8,
    identification: u16,
    ttl: u8,
    protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self {
            tos: 0,
            identification: 0,
            ttl: 64,
            protocol: 0,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            payload: Vec::new(),
        }
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn src_addr(mut self, addr: Ipv4Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv4Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = (MIN_HEADER_SIZE + self.payload.len()) as u16;
        let mut buffer = Vec::with_capacity(total_length as usize);

        buffer.push(0x45);
        buffer.push(self.tos);
        buffer.extend_from_slice(&total_length.to_be_bytes());
        buffer.extend_from_slice(&self.identification.to_be_bytes());
        // DF set, no fragment offset
        buffer.extend_from_slice(&0x4000u16.to_be_bytes());
        buffer.push(self.ttl);
        buffer.push(self.protocol);
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend_from_slice(&self.src_addr.octets());
        buffer.extend_from_slice(&self.dst_addr.octets());

        let sum = checksum(&buffer[..MIN_HEADER_SIZE]);
        buffer[10..12].copy_from_slice(&sum.to_be_bytes());

        buffer.extend_from_slice(&self.payload);
        buffer
    }
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self::new()
    }
}
