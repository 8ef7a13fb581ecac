//! Address/port endpoint pairs.

use std::fmt;
use std::str::FromStr;

use super::{AddrParseError, IpAddress, Ipv4Address, Ipv6Address};

/// An IPv4 address plus port. Textual form `a.b.c.d:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Ipv4Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        let (address, port) = s.rsplit_once(':')?;
        Some(Self {
            address: Ipv4Address::from_string(address)?,
            port: parse_port(port)?,
        })
    }
}

impl fmt::Display for Ipv4Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Ipv4Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or(AddrParseError)
    }
}

/// An IPv6 address plus port. Textual form `[addr]:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv6Endpoint {
    pub address: Ipv6Address,
    pub port: u16,
}

impl Ipv6Endpoint {
    pub const fn new(address: Ipv6Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('[')?;
        let (address, port) = rest.split_once(']')?;
        let port = port.strip_prefix(':')?;
        Some(Self {
            address: Ipv6Address::from_string(address)?,
            port: parse_port(port)?,
        })
    }
}

impl fmt::Display for Ipv6Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.address, self.port)
    }
}

impl FromStr for Ipv6Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or(AddrParseError)
    }
}

/// Either kind of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpEndpoint {
    V4(Ipv4Endpoint),
    V6(Ipv6Endpoint),
}

impl IpEndpoint {
    pub fn new(address: IpAddress, port: u16) -> Self {
        match address {
            IpAddress::V4(v4) => IpEndpoint::V4(Ipv4Endpoint::new(v4, port)),
            IpAddress::V6(v6) => IpEndpoint::V6(Ipv6Endpoint::new(v6, port)),
        }
    }

    pub fn address(&self) -> IpAddress {
        match self {
            IpEndpoint::V4(e) => IpAddress::V4(e.address),
            IpEndpoint::V6(e) => IpAddress::V6(e.address),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            IpEndpoint::V4(e) => e.port,
            IpEndpoint::V6(e) => e.port,
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        if let Some(v4) = Ipv4Endpoint::from_string(s) {
            return Some(IpEndpoint::V4(v4));
        }
        Ipv6Endpoint::from_string(s).map(IpEndpoint::V6)
    }
}

impl From<Ipv4Endpoint> for IpEndpoint {
    fn from(endpoint: Ipv4Endpoint) -> Self {
        IpEndpoint::V4(endpoint)
    }
}

impl From<Ipv6Endpoint> for IpEndpoint {
    fn from(endpoint: Ipv6Endpoint) -> Self {
        IpEndpoint::V6(endpoint)
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpEndpoint::V4(e) => e.fmt(f),
            IpEndpoint::V6(e) => e.fmt(f),
        }
    }
}

impl FromStr for IpEndpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or(AddrParseError)
    }
}

impl From<std::net::SocketAddr> for IpEndpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => {
                IpEndpoint::V4(Ipv4Endpoint::new((*v4.ip()).into(), v4.port()))
            }
            std::net::SocketAddr::V6(v6) => {
                IpEndpoint::V6(Ipv6Endpoint::new((*v6.ip()).into(), v6.port()))
            }
        }
    }
}

impl From<IpEndpoint> for std::net::SocketAddr {
    fn from(endpoint: IpEndpoint) -> Self {
        match endpoint {
            IpEndpoint::V4(e) => std::net::SocketAddr::new(
                std::net::IpAddr::V4(e.address.into()),
                e.port,
            ),
            IpEndpoint::V6(e) => std::net::SocketAddr::new(
                std::net::IpAddr::V6(e.address.into()),
                e.port,
            ),
        }
    }
}

/// Strict decimal port: no sign, no leading zeros (except "0"), no overflow.
fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Endpoint forms parse and print canonically
    #[test]
    fn test_round_trip() {
        for text in ["127.0.0.1:80", "0.0.0.0:0", "[::1]:8080", "[2001:db8::1]:443"] {
            let endpoint = IpEndpoint::from_string(text).unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    /// Ports reject signs, leading zeros, and overflow
    #[test]
    fn test_bad_ports() {
        for bad in [
            "127.0.0.1",
            "127.0.0.1:",
            "127.0.0.1:65536",
            "127.0.0.1:0080",
            "127.0.0.1:+80",
            "[::1]8080",
            "[::1]:999999",
        ] {
            assert_eq!(IpEndpoint::from_string(bad), None, "accepted {bad:?}");
        }
    }

    /// Accessors expose the inner pair
    #[test]
    fn test_accessors() {
        let endpoint = IpEndpoint::from_string("[fe80::1]:9000").unwrap();
        assert!(endpoint.address().is_v6());
        assert_eq!(endpoint.port(), 9000);
    }
}
