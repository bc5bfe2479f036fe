//! Crate-wide primitive types: MAC addresses, peer sockets, wall clock.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Unix timestamp in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Error, Debug)]
pub enum TypeError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

/// 48-bit Ethernet MAC address.
///
/// The all-zero MAC is the protocol "unknown" sentinel: registrations and
/// queries may carry it, and the peer table resolves such records through
/// the socket index instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const NULL: Mac = Mac([0; 6]);
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Group bit of the first octet covers both multicast and broadcast.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Random locally-administered unicast MAC, used as the supernode's own
    /// identity on the overlay.
    pub fn random_local() -> Self {
        let mut bytes: [u8; 6] = rand::random();
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        Mac(bytes)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for Mac {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(TypeError::InvalidMac(s.into()));
        }
        let mut bytes = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(p, 16).map_err(|_| TypeError::InvalidMac(s.into()))?;
        }
        Ok(Mac(bytes))
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Datapath transport a peer is reachable on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
        }
    }
}

/// A peer's last-observed socket, tagged with the transport it arrived on.
///
/// Replies to a peer must use the tagged transport: TCP peers are reached
/// through their accepted session, never by dialing back over UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSocket {
    pub ip: IpAddr,
    pub port: u16,
    pub proto: Proto,
}

impl PeerSocket {
    pub fn new(ip: IpAddr, port: u16, proto: Proto) -> Self {
        Self { ip, port, proto }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port(), proto: Proto::Udp }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port(), proto: Proto::Tcp }
    }

    pub fn sock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Placeholder for anchors whose hostname has not resolved yet.
    pub fn unresolved() -> Self {
        Self {
            ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
            proto: Proto::Udp,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.port == 0
    }
}

impl fmt::Display for PeerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.sock_addr())
    }
}

impl Serialize for PeerSocket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
