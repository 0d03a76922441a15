//! IPv4 prefix type with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 prefix in CIDR notation (e.g., 10.0.0.0/24 or 203.0.113.5/32).
///
/// The address is kept as given, so `10.0.0.5/24` still remembers `.5`;
/// [`Ipv4Prefix::network`] yields the masked low address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Prefix {
    /// Creates a new prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum 32",
                prefix_len
            )));
        }

        Ok(Ipv4Prefix {
            address,
            prefix_len,
        })
    }

    /// Creates a /32 host prefix.
    pub const fn host(address: Ipv4Addr) -> Self {
        Ipv4Prefix {
            address,
            prefix_len: 32,
        }
    }

    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    /// Returns the low (network) address of this prefix.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// Returns the high (broadcast) address of this prefix.
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.mask())
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network())
    }

    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == 32
    }

    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Iterates every address of the prefix from low to high.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let low = u32::from(self.network());
        let high = u32::from(self.last());
        (low..=high).map(Ipv4Addr::from)
    }
}

impl From<Ipv4Addr> for Ipv4Prefix {
    fn from(address: Ipv4Addr) -> Self {
        Ipv4Prefix::host(address)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ParseError;

    /// Parses `a.b.c.d/len`; a bare address is taken as a /32.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = match s.rsplit_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
        let prefix_len = match len_str {
            Some(len) => len
                .parse::<u8>()
                .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?,
            None => 32,
        };

        Ipv4Prefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(prefix: Ipv4Prefix) -> Self {
        prefix.to_string()
    }
}
