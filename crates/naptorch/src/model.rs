//! Topology records consumed by the control plane.
//!
//! Routers and external networks are owned by external configuration; the
//! only record this crate writes is the [`PrimaryAssignment`].

use chrono::{DateTime, Utc};
use napt_types::{Ipv4Prefix, MacAddress, NodeId, RouterId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Provider type of an external network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Flat,
    Vlan,
    Vxlan,
    Gre,
}

impl ProviderType {
    /// Flat and VLAN networks leave the fabric through a per-node boundary
    /// group that rewrites the destination MAC to the external gateway.
    pub fn needs_boundary_group(&self) -> bool {
        matches!(self, ProviderType::Flat | ProviderType::Vlan)
    }

    /// VXLAN networks are reached across a routing domain boundary and get
    /// the cross-domain translation mode.
    pub fn is_cross_domain(&self) -> bool {
        matches!(self, ProviderType::Vxlan)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderType::Flat => "flat",
            ProviderType::Vlan => "vlan",
            ProviderType::Vxlan => "vxlan",
            ProviderType::Gre => "gre",
        };
        f.write_str(s)
    }
}

/// External (provider) network a router's SNAT traffic leaves through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNetwork {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderType,
    /// VPN instance the network's external prefixes are advertised in.
    pub vpn: String,
}

/// One external address (or subnet) assigned to a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalIp {
    pub prefix: Ipv4Prefix,
    pub subnet_id: Uuid,
}

impl ExternalIp {
    pub fn new(prefix: Ipv4Prefix, subnet_id: Uuid) -> Self {
        Self { prefix, subnet_id }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.prefix.address()
    }
}

/// Tenant router with SNAT towards an external network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    pub external_network_id: Uuid,
    pub external_ips: Vec<ExternalIp>,
    pub gateway_mac: Option<MacAddress>,
    pub enable_snat: bool,
}

impl Router {
    pub fn new(id: RouterId, name: impl Into<String>, external_network_id: Uuid) -> Self {
        Self {
            id,
            name: name.into(),
            external_network_id,
            external_ips: Vec::new(),
            gateway_mac: None,
            enable_snat: true,
        }
    }

    pub fn with_external_ip(mut self, prefix: Ipv4Prefix, subnet_id: Uuid) -> Self {
        self.external_ips.push(ExternalIp::new(prefix, subnet_id));
        self
    }

    pub fn with_gateway_mac(mut self, mac: MacAddress) -> Self {
        self.gateway_mac = Some(mac);
        self
    }

    pub fn with_snat(mut self, enable: bool) -> Self {
        self.enable_snat = enable;
        self
    }
}

/// Persisted owner of a router's NAT state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryAssignment {
    pub router: String,
    pub node: NodeId,
    pub elected_at: DateTime<Utc>,
}

impl PrimaryAssignment {
    pub fn new(router: impl Into<String>, node: NodeId) -> Self {
        Self {
            router: router.into(),
            node,
            elected_at: Utc::now(),
        }
    }
}

/// Encapsulation endpoint of a node. Its presence marks the node healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub node: NodeId,
    pub ip: Ipv4Addr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_classification() {
        assert!(ProviderType::Flat.needs_boundary_group());
        assert!(ProviderType::Vlan.needs_boundary_group());
        assert!(!ProviderType::Vxlan.needs_boundary_group());
        assert!(ProviderType::Vxlan.is_cross_domain());
        assert!(!ProviderType::Gre.is_cross_domain());
    }

    #[test]
    fn test_router_builder() {
        let net = Uuid::new_v4();
        let router = Router::new(RouterId::new(1), "r1", net)
            .with_external_ip("203.0.113.5/32".parse().unwrap(), Uuid::new_v4())
            .with_snat(false);

        assert_eq!(router.external_ips.len(), 1);
        assert_eq!(router.external_ips[0].address(), Ipv4Addr::new(203, 0, 113, 5));
        assert!(!router.enable_snat);
        assert!(router.gateway_mac.is_none());
    }

    #[test]
    fn test_assignment_serializes() {
        let assignment = PrimaryAssignment::new("r1", NodeId::new(1));
        let json = serde_json::to_string(&assignment).unwrap();
        assert!(json.contains("\"router\":\"r1\""));
        assert!(json.contains("\"node\":1"));
    }
}
