//! Protocol tags identifying who proposed a default gateway.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The protocol handler that registered a gateway.
///
/// The four well-known handlers have dedicated variants; any other lowercase
/// tag is carried as [`ProtocolTag::Other`] so new handlers can register
/// without a code change. Ordering is lexicographic on the tag text, which is
/// what the priority policy uses as its final tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProtocolTag {
    /// DHCPv4/DHCPv6 client.
    Dhcp,
    /// IPv6 router advertisement daemon.
    Ra,
    /// Statically configured gateway.
    Static,
    /// Point-to-point link.
    Ppp,
    /// Any other handler.
    Other(String),
}

impl ProtocolTag {
    pub fn as_str(&self) -> &str {
        match self {
            ProtocolTag::Dhcp => "dhcp",
            ProtocolTag::Ra => "ra",
            ProtocolTag::Static => "static",
            ProtocolTag::Ppp => "ppp",
            ProtocolTag::Other(tag) => tag,
        }
    }

    /// Returns true for the tags defaultconf ships handlers for.
    pub const fn is_well_known(&self) -> bool {
        !matches!(self, ProtocolTag::Other(_))
    }
}

impl Ord for ProtocolTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for ProtocolTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolTag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhcp" => Ok(ProtocolTag::Dhcp),
            "ra" => Ok(ProtocolTag::Ra),
            "static" => Ok(ProtocolTag::Static),
            "ppp" => Ok(ProtocolTag::Ppp),
            other => {
                let valid = !other.is_empty()
                    && other.len() <= 32
                    && other
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
                if valid {
                    Ok(ProtocolTag::Other(other.to_string()))
                } else {
                    Err(ParseError::InvalidProtocolTag(other.to_string()))
                }
            }
        }
    }
}

impl TryFrom<String> for ProtocolTag {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolTag> for String {
    fn from(tag: ProtocolTag) -> Self {
        tag.as_str().to_string()
    }
}
