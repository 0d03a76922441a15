//! Node, router and virtual network identifiers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a forwarding node (a "DPN" in fabric terms).
///
/// Ordering is numeric; election tie-breaks rely on it.
///
/// ```
/// use napt_types::NodeId;
///
/// let node: NodeId = "dpn-7".parse().unwrap();
/// assert_eq!(node, NodeId::new(7));
/// assert_eq!(node.to_string(), "dpn-7");
/// assert_eq!("7".parse::<NodeId>().unwrap(), node);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dpn-{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("dpn-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(NodeId)
            .map_err(|_| ParseError::InvalidNodeId(s.to_string()))
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

/// Numeric router identifier.
///
/// Carried in rule metadata and used as the tunnel key toward the primary
/// node when the router has no VNI of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId(u32);

impl RouterId {
    pub const fn new(id: u32) -> Self {
        RouterId(id)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for RouterId {
    fn from(id: u32) -> Self {
        RouterId(id)
    }
}

/// A 24-bit virtual network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Vni(u32);

impl Vni {
    pub const MAX: u32 = 0x00ff_ffff;

    /// Creates a VNI, rejecting values wider than 24 bits.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value > Self::MAX {
            return Err(ParseError::InvalidVni(value));
        }
        Ok(Vni(value))
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Vni {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Vni::new(value)
    }
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> Self {
        vni.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_id_parse() {
        assert_eq!("dpn-1".parse::<NodeId>().unwrap(), NodeId::new(1));
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId::new(42));
        assert!("dpn-".parse::<NodeId>().is_err());
        assert!("switch-1".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_ordering_is_numeric() {
        let mut nodes = vec![NodeId::new(10), NodeId::new(2), NodeId::new(1)];
        nodes.sort();
        assert_eq!(nodes, vec![NodeId::new(1), NodeId::new(2), NodeId::new(10)]);
    }

    #[test]
    fn test_vni_range() {
        assert!(Vni::new(0).is_ok());
        assert!(Vni::new(Vni::MAX).is_ok());
        assert_eq!(Vni::new(Vni::MAX + 1), Err(ParseError::InvalidVni(Vni::MAX + 1)));
    }

    #[test]
    fn test_vni_serde_rejects_wide_values() {
        let vni: Vni = serde_json::from_str("70000").unwrap();
        assert_eq!(vni.value(), 70000);
        assert!(serde_json::from_str::<Vni>("16777216").is_err());
    }
}
