//! Common types for the NAPT control plane.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the election, allocation and flow programming code:
//!
//! - [`NodeId`]: stable identifier of a forwarding node
//! - [`RouterId`]: numeric identifier of a tenant router
//! - [`Vni`]: 24-bit virtual network identifier
//! - [`Protocol`]: transport protocols subject to port translation
//! - [`Ipv4Prefix`]: IPv4 network prefixes (CIDR notation)
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses

mod ids;
mod ip;
mod mac;
mod protocol;

pub use ids::{NodeId, RouterId, Vni};
pub use ip::Ipv4Prefix;
pub use mac::MacAddress;
pub use protocol::Protocol;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid VNI: {0} (must fit in 24 bits)")]
    InvalidVni(u32),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
}
