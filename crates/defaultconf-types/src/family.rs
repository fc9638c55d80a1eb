//! Address family of a gateway, rule or route.

use crate::{IpPrefix, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IP address family.
///
/// Serialized as `inet` / `inet6`. The `ip`/`ip6` and `AF_INET`/`AF_INET6`
/// spellings are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "inet", alias = "ip", alias = "ip4", alias = "ipv4", alias = "AF_INET")]
    Inet,
    #[serde(rename = "inet6", alias = "ip6", alias = "ipv6", alias = "AF_INET6")]
    Inet6,
}

impl AddressFamily {
    /// Both families, in evaluation order.
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Inet, AddressFamily::Inet6];

    /// Returns the family of an address.
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// Returns true if `addr` belongs to this family.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (AddressFamily::Inet, IpAddr::V4(_)) | (AddressFamily::Inet6, IpAddr::V6(_))
        )
    }

    /// The unspecified address of this family (`0.0.0.0` or `::`).
    pub const fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Maximum prefix length for this family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            AddressFamily::Inet => 32,
            AddressFamily::Inet6 => 128,
        }
    }

    /// The default destination (`0.0.0.0/0` or `::/0`).
    pub fn default_destination(&self) -> IpPrefix {
        IpPrefix::default_route(*self)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Inet => "inet",
            AddressFamily::Inet6 => "inet6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inet" | "ip" | "ip4" | "ipv4" | "AF_INET" => Ok(AddressFamily::Inet),
            "inet6" | "ip6" | "ipv6" | "AF_INET6" => Ok(AddressFamily::Inet6),
            _ => Err(ParseError::InvalidAddressFamily(s.to_string())),
        }
    }
}
