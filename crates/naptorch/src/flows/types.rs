//! Forwarding rule and redirection group types.

use napt_types::{Ipv4Prefix, MacAddress, NodeId, Protocol, RouterId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Base cookie for every rule this control plane owns.
pub const COOKIE_NAPT_BASE: u64 = 0x8000_0000_0000_0000;

pub const PRIORITY_SESSION: u16 = 10;
pub const PRIORITY_TRANSLATION: u16 = 6;
pub const PRIORITY_DEFAULT: u16 = 5;
pub const PRIORITY_MISS: u16 = 1;

/// Pipeline stages holding translation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    Fib,
    PreSnat,
    Terminating,
    SnatConntrack,
    InboundNapt,
    OutboundNapt,
    NaptForward,
}

impl Table {
    /// Numeric table id; stable because it is part of every rule reference.
    pub const fn id(&self) -> u8 {
        match self {
            Table::Fib => 21,
            Table::PreSnat => 26,
            Table::Terminating => 36,
            Table::SnatConntrack => 43,
            Table::InboundNapt => 44,
            Table::OutboundNapt => 46,
            Table::NaptForward => 47,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Table::Fib => "fib",
            Table::PreSnat => "pre-snat",
            Table::Terminating => "terminating",
            Table::SnatConntrack => "snat-conntrack",
            Table::InboundNapt => "inbound-napt",
            Table::OutboundNapt => "outbound-napt",
            Table::NaptForward => "napt-forward",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic rule reference, unique per node.
///
/// Built from node, table and router plus optional qualifiers, so the same
/// logical rule always maps to the same reference and install/remove by
/// reference is idempotent.
///
/// ```
/// use napt_orchagent::flows::{RuleRef, Table};
/// use napt_types::{NodeId, RouterId};
///
/// let r = RuleRef::new(NodeId::new(1), Table::InboundNapt, RouterId::new(7)).with("203.0.113.5");
/// assert_eq!(r.as_str(), "dpn-1.44.7.203.0.113.5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleRef(String);

impl RuleRef {
    pub fn new(node: NodeId, table: Table, router: RouterId) -> Self {
        RuleRef(format!("{}.{}.{}", node, table.id(), router))
    }

    /// Appends one qualifier.
    pub fn with(mut self, qualifier: impl fmt::Display) -> Self {
        use fmt::Write;
        // Writing into a String cannot fail.
        let _ = write!(self.0, ".{}", qualifier);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection tracking state bits matched by conntrack-assisted rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtState {
    New,
    Established,
    Tracked,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchField {
    RouterMetadata(RouterId),
    TunnelKey(u32),
    SrcIp(Ipv4Prefix),
    DstIp(Ipv4Prefix),
    IpProto(Protocol),
    SrcPort(u16),
    DstPort(u16),
    CtState(CtState),
}

/// Source NAT performed by the dataplane's connection tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtNat {
    pub address: Ipv4Addr,
    pub port_low: u16,
    pub port_high: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    GotoTable(Table),
    Group(u32),
    PuntToController,
    SetRouterMetadata(RouterId),
    SetTunnelKey(u32),
    SetSrcIp(Ipv4Addr),
    SetDstIp(Ipv4Addr),
    SetSrcPort(u16),
    SetDstPort(u16),
    SetDstMac(MacAddress),
    /// Encapsulate towards a remote tunnel endpoint.
    Tunnel { remote: Ipv4Addr },
    /// Send out of the node's port into an external provider network.
    OutputProvider(Uuid),
    Conntrack {
        zone: u16,
        commit: bool,
        nat: Option<CtNat>,
    },
}

/// A match-action entry in one table of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub node: NodeId,
    pub table: Table,
    pub rule_ref: RuleRef,
    pub priority: u16,
    pub matches: Vec<MatchField>,
    pub actions: Vec<Action>,
    pub cookie: u64,
    /// Seconds without traffic before the dataplane evicts the rule (0: never).
    pub idle_timeout: u32,
}

impl ForwardingRule {
    pub fn new(node: NodeId, table: Table, rule_ref: RuleRef, priority: u16) -> Self {
        Self {
            node,
            table,
            rule_ref,
            priority,
            matches: Vec::new(),
            actions: Vec::new(),
            cookie: COOKIE_NAPT_BASE | (u64::from(table.id()) << 32),
            idle_timeout: 0,
        }
    }

    pub fn matching(mut self, field: MatchField) -> Self {
        self.matches.push(field);
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_cookie_router(mut self, router: RouterId) -> Self {
        self.cookie |= u64::from(router.value());
        self
    }

    pub fn with_idle_timeout(mut self, secs: u32) -> Self {
        self.idle_timeout = secs;
        self
    }

    /// Redirection group this rule depends on, if any.
    pub fn group_dependency(&self) -> Option<u32> {
        self.actions.iter().find_map(|a| match a {
            Action::Group(id) => Some(*id),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    /// One bucket chosen per flow by weight.
    Select,
    /// Every bucket applied.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub weight: u16,
    pub actions: Vec<Action>,
}

/// Per-node weighted-bucket group a rule can forward to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionGroup {
    pub node: NodeId,
    pub id: u32,
    pub kind: GroupKind,
    pub buckets: Vec<Bucket>,
}

impl RedirectionGroup {
    pub fn new(node: NodeId, id: u32, kind: GroupKind) -> Self {
        Self {
            node,
            id,
            kind,
            buckets: Vec::new(),
        }
    }

    pub fn with_bucket(mut self, weight: u16, actions: Vec<Action>) -> Self {
        self.buckets.push(Bucket { weight, actions });
        self
    }
}
