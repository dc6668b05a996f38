use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors produced while parsing a CIDR network specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkParseError {
    #[error("invalid network address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),
}

/// An IPv4 or IPv6 network in CIDR form.
///
/// The address is masked on construction, so `10.1.2.3/8` and `10.0.0.0/8`
/// describe the same network. A bare address parses as a host network
/// (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
    mask: u128,
}

impl IpNetwork {
    /// Build a network from an address and prefix length.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkParseError> {
        let width = family_width(&address);
        if prefix_len > width {
            return Err(NetworkParseError::InvalidPrefix(prefix_len.to_string()));
        }

        let mask = mask_for(prefix_len, width);
        let masked = address_bits(&address) & mask;
        let address = match address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(masked as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(masked)),
        };

        Ok(Self { address, prefix_len, mask })
    }

    /// Parse `address/prefix` or a bare address.
    pub fn parse(spec: &str) -> Result<Self, NetworkParseError> {
        let spec = spec.trim();
        let (addr_part, prefix_part) = match spec.split_once('/') {
            Some((addr, prefix)) => (addr.trim(), Some(prefix.trim())),
            None => (spec, None),
        };

        let address = IpAddr::from_str(addr_part)
            .map_err(|_| NetworkParseError::InvalidAddress(addr_part.to_string()))?;

        let prefix_len = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| NetworkParseError::InvalidPrefix(p.to_string()))?,
            None => family_width(&address),
        };

        Self::new(address, prefix_len)
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `candidate` falls inside this network.
    ///
    /// IPv4-mapped IPv6 candidates are unwrapped first. A candidate of the
    /// other address family never matches.
    pub fn contains(&self, candidate: IpAddr) -> bool {
        let candidate = candidate.to_canonical();
        let same_family = matches!(
            (&self.address, &candidate),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        );
        if !same_family {
            return false;
        }

        (address_bits(&candidate) & self.mask) == address_bits(&self.address)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn family_width(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn address_bits(address: &IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn mask_for(prefix_len: u8, width: u8) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    let full: u128 = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    let host_bits = u32::from(width - prefix_len);
    (full >> host_bits) << host_bits
}
