//! Per-connection rewrite rules installed on the primary.
//!
//! References are derived from the internal endpoint only, so a session can
//! be torn down without knowing which external port it was given.

use super::types::{Action, ForwardingRule, MatchField, RuleRef, Table, PRIORITY_SESSION};
use napt_types::{Ipv4Prefix, NodeId, Protocol, RouterId};
use std::net::SocketAddrV4;

/// One translated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    pub router: RouterId,
    pub internal: SocketAddrV4,
    pub external: SocketAddrV4,
    pub protocol: Protocol,
}

fn session_ref(
    node: NodeId,
    table: Table,
    router: RouterId,
    internal: SocketAddrV4,
    protocol: Protocol,
    direction: &str,
) -> RuleRef {
    RuleRef::new(node, table, router)
        .with(internal.ip())
        .with(internal.port())
        .with(protocol)
        .with(direction)
}

pub fn inbound_ref(node: NodeId, router: RouterId, internal: SocketAddrV4, protocol: Protocol) -> RuleRef {
    session_ref(node, Table::InboundNapt, router, internal, protocol, "in")
}

pub fn outbound_ref(node: NodeId, router: RouterId, internal: SocketAddrV4, protocol: Protocol) -> RuleRef {
    session_ref(node, Table::OutboundNapt, router, internal, protocol, "out")
}

/// Rewrites the external destination back to the internal endpoint.
pub fn inbound_rule(node: NodeId, session: &Session, idle_timeout: u32) -> ForwardingRule {
    ForwardingRule::new(
        node,
        Table::InboundNapt,
        inbound_ref(node, session.router, session.internal, session.protocol),
        PRIORITY_SESSION,
    )
    .with_cookie_router(session.router)
    .with_idle_timeout(idle_timeout)
    .matching(MatchField::RouterMetadata(session.router))
    .matching(MatchField::DstIp(Ipv4Prefix::host(*session.external.ip())))
    .matching(MatchField::IpProto(session.protocol))
    .matching(MatchField::DstPort(session.external.port()))
    .then(Action::SetDstIp(*session.internal.ip()))
    .then(Action::SetDstPort(session.internal.port()))
    .then(Action::GotoTable(Table::Fib))
}

/// Rewrites the internal source to the external endpoint.
pub fn outbound_rule(node: NodeId, session: &Session, idle_timeout: u32) -> ForwardingRule {
    ForwardingRule::new(
        node,
        Table::OutboundNapt,
        outbound_ref(node, session.router, session.internal, session.protocol),
        PRIORITY_SESSION,
    )
    .with_cookie_router(session.router)
    .with_idle_timeout(idle_timeout)
    .matching(MatchField::RouterMetadata(session.router))
    .matching(MatchField::SrcIp(Ipv4Prefix::host(*session.internal.ip())))
    .matching(MatchField::IpProto(session.protocol))
    .matching(MatchField::SrcPort(session.internal.port()))
    .then(Action::SetSrcIp(*session.external.ip()))
    .then(Action::SetSrcPort(session.external.port()))
    .then(Action::GotoTable(Table::NaptForward))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session {
            router: RouterId::new(1),
            internal: "10.0.0.5:53124".parse().unwrap(),
            external: "203.0.113.5:49152".parse().unwrap(),
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_session_refs() {
        let s = session();
        let node = NodeId::new(1);
        assert_eq!(
            inbound_rule(node, &s, 300).rule_ref.as_str(),
            "dpn-1.44.1.10.0.0.5.53124.tcp.in"
        );
        assert_eq!(
            outbound_rule(node, &s, 300).rule_ref,
            outbound_ref(node, s.router, s.internal, s.protocol)
        );
    }

    #[test]
    fn test_rewrites() {
        let s = session();
        let inbound = inbound_rule(NodeId::new(1), &s, 300);
        assert!(inbound.matches.contains(&MatchField::DstPort(49152)));
        assert_eq!(
            &inbound.actions[..2],
            &[
                Action::SetDstIp("10.0.0.5".parse().unwrap()),
                Action::SetDstPort(53124)
            ]
        );
        assert_eq!(inbound.idle_timeout, 300);

        let outbound = outbound_rule(NodeId::new(1), &s, 300);
        assert_eq!(
            &outbound.actions[..2],
            &[
                Action::SetSrcIp("203.0.113.5".parse().unwrap()),
                Action::SetSrcPort(49152)
            ]
        );
    }
}
