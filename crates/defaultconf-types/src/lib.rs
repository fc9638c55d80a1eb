//! Common types for default route selection.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the defaultconf engine, its configuration and its registration store:
//!
//! - [`AddressFamily`]: IPv4 (`inet`) or IPv6 (`inet6`)
//! - [`ProtocolTag`]: the protocol that proposed a gateway (`dhcp`, `ra`, ...)
//! - [`IpPrefix`]: IP network prefixes (CIDR notation) with containment checks

mod family;
mod ip;
mod protocol;

pub use family::AddressFamily;
pub use ip::IpPrefix;
pub use protocol::ProtocolTag;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("unknown address family: {0} (expected inet or inet6)")]
    InvalidAddressFamily(String),

    #[error("invalid protocol tag: {0:?} (expected lowercase [a-z0-9_-]+)")]
    InvalidProtocolTag(String),
}
