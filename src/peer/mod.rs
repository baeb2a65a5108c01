use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub mod error;
pub mod handshake;
pub mod message;
pub mod session;
pub mod state;

pub use error::PeerError;
pub use session::{PeerSession, SessionConfig, SessionState};

const PSTR: &str = "BitTorrent protocol";
const PSTR_LEN: u8 = PSTR.len() as u8; // always 19

/// Size of one compact peer entry: 4 address bytes then 2 port bytes.
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip_addr: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    /// Parses one compact entry, both fields in network order.
    pub fn from_compact(chunk: &[u8]) -> Option<Self> {
        let chunk: &[u8; COMPACT_PEER_LEN] = chunk.try_into().ok()?;
        Some(Self {
            ip_addr: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.port))
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            ip_addr: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip_addr, self.port)
    }
}
