//! Node identity

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GmsError;

/// Identity of a cluster node: an IP address and port.
///
/// Ordering is lexicographic on the IP and then the port, which is what
/// makes sorted member lists agree on the same leader everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    /// Create an address from its parts
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback address with the given port
    pub fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// IP part
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether both addresses live on the same host
    pub fn same_host(&self, other: &Address) -> bool {
        self.ip == other.ip
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl FromStr for Address {
    type Err = GmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Address::from)
            .map_err(|e| GmsError::Configuration(format!("invalid address '{s}': {e}")))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}
