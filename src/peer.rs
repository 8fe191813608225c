use crate::constants::COMPACT_ADDR_LEN;
use anyhow::{bail, Result};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A peer is its full `ip:port` identity. Two peers on the same host are
/// distinct; a bare IP is never enough to key a record.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct Peer(SocketAddrV4);

impl Peer {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> &SocketAddrV4 {
        &self.0
    }

    pub fn from_compact_bytes(buff: &[u8]) -> Result<Self> {
        if buff.len() != COMPACT_ADDR_LEN {
            bail!(
                "Peer::from_compact_bytes buff size is {}, expected {}",
                buff.len(),
                COMPACT_ADDR_LEN
            );
        }

        Ok(Self(SocketAddrV4::new(
            std::net::Ipv4Addr::new(buff[0], buff[1], buff[2], buff[3]),
            ((buff[4] as u16) << 8) | buff[5] as u16,
        )))
    }

    pub fn to_compact_bytes(self) -> [u8; COMPACT_ADDR_LEN] {
        let mut buff = [0u8; COMPACT_ADDR_LEN];
        buff[..4].copy_from_slice(&self.0.ip().octets());
        buff[4] = (self.0.port() >> 8) as u8;
        buff[5] = (self.0.port() & 0xff) as u8;
        buff
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Peer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(s.parse::<SocketAddrV4>()?))
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(value: SocketAddrV4) -> Self {
        Self(value)
    }
}

impl From<SocketAddr> for Peer {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(addr) => Self(addr),
            SocketAddr::V6(addr) => panic!("no support for IPv6 ({addr:?})"),
        }
    }
}

impl From<Peer> for SocketAddrV4 {
    fn from(value: Peer) -> Self {
        value.0
    }
}

impl From<Peer> for SocketAddr {
    fn from(value: Peer) -> Self {
        SocketAddr::V4(value.0)
    }
}
