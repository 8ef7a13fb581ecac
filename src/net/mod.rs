//! IP addresses and endpoints.
//!
//! Byte-exact address types with strict textual forms: dotted decimal for
//! IPv4 (leading zeros, per-octet overflow and trailing garbage rejected),
//! RFC 5952 contracted form plus the IPv4-mapped form for IPv6. Formatting
//! always produces the canonical contraction, so `from_string ∘ to_string`
//! is the identity on every address.

mod endpoint;
mod ipv4;
mod ipv6;

pub use endpoint::{IpEndpoint, Ipv4Endpoint, Ipv6Endpoint};
pub use ipv4::Ipv4Address;
pub use ipv6::Ipv6Address;

/// Error of the `FromStr` implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid address syntax")]
pub struct AddrParseError;

/// Either kind of IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    pub fn is_v4(&self) -> bool {
        matches!(self, IpAddress::V4(..))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, IpAddress::V6(..))
    }

    /// Parses either textual form, trying dotted decimal first.
    pub fn from_string(s: &str) -> Option<Self> {
        if let Some(v4) = Ipv4Address::from_string(s) {
            return Some(IpAddress::V4(v4));
        }
        Ipv6Address::from_string(s).map(IpAddress::V6)
    }
}

impl From<Ipv4Address> for IpAddress {
    fn from(address: Ipv4Address) -> Self {
        IpAddress::V4(address)
    }
}

impl From<Ipv6Address> for IpAddress {
    fn from(address: Ipv6Address) -> Self {
        IpAddress::V6(address)
    }
}

impl std::fmt::Display for IpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpAddress::V4(address) => address.fmt(f),
            IpAddress::V6(address) => address.fmt(f),
        }
    }
}

impl std::str::FromStr for IpAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or(AddrParseError)
    }
}

impl From<std::net::IpAddr> for IpAddress {
    fn from(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(v4) => IpAddress::V4(v4.into()),
            std::net::IpAddr::V6(v6) => IpAddress::V6(v6.into()),
        }
    }
}

impl From<IpAddress> for std::net::IpAddr {
    fn from(addr: IpAddress) -> Self {
        match addr {
            IpAddress::V4(v4) => std::net::IpAddr::V4(v4.into()),
            IpAddress::V6(v6) => std::net::IpAddr::V6(v6.into()),
        }
    }
}
