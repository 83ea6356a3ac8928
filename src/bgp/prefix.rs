//! IPv4 prefixes as carried in UPDATE withdrawn-routes and NLRI fields.
//!
//! A prefix is stored masked: host bits beyond the mask length are always zero,
//! so two prefixes that differ only in host bits compare equal.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use ipnetwork::Ipv4Network;

use super::message::DecodeError;

/// A masked IPv4 network, the key of every RIB table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    addr: Ipv4Addr,
    len: u8,
}

impl Prefix {
    /// Build a prefix, clearing host bits beyond `len`.
    ///
    /// Returns `None` if `len` exceeds 32.
    pub fn new(addr: Ipv4Addr, len: u8) -> Option<Self> {
        if len > 32 {
            return None;
        }
        Some(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask(len)),
            len,
        })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Number of address bytes on the wire: `ceil(len / 8)`.
    pub fn wire_bytes(&self) -> usize {
        (self.len as usize).div_ceil(8)
    }

    /// Encoded size including the length byte.
    pub fn encoded_len(&self) -> usize {
        1 + self.wire_bytes()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.len);
        buf.put_slice(&self.addr.octets()[..self.wire_bytes()]);
    }

    /// Decode one prefix: a length byte followed by only the significant address bytes.
    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if !data.has_remaining() {
            return Err(DecodeError::TruncatedMessage);
        }
        let len = data.get_u8();
        if len > 32 {
            return Err(DecodeError::InvalidPrefixLength(len));
        }

        let byte_len = (len as usize).div_ceil(8);
        if data.remaining() < byte_len {
            return Err(DecodeError::TruncatedMessage);
        }

        let mut octets = [0u8; 4];
        data.copy_to_slice(&mut octets[..byte_len]);

        // len <= 32 was checked above.
        Ok(Self {
            addr: Ipv4Addr::from(u32::from_be_bytes(octets) & mask(len)),
            len,
        })
    }

    /// Decode a run of prefixes until the buffer is exhausted.
    pub fn decode_all(data: &mut impl Buf) -> Result<Vec<Self>, DecodeError> {
        let mut prefixes = Vec::new();
        while data.has_remaining() {
            prefixes.push(Self::decode(data)?);
        }
        Ok(prefixes)
    }
}

fn mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len as u32)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl From<Ipv4Network> for Prefix {
    fn from(network: Ipv4Network) -> Self {
        Self {
            addr: network.network(),
            len: network.prefix(),
        }
    }
}

impl FromStr for Prefix {
    type Err = ipnetwork::IpNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Ipv4Network::from_str(s)?.into())
    }
}
