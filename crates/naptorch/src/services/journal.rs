//! Ordered record of collaborator side effects.

use crate::flows::{RuleRef, Table};
use napt_types::{Ipv4Prefix, NodeId};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    InstallRule {
        node: NodeId,
        table: Table,
        rule_ref: RuleRef,
    },
    RemoveRule {
        node: NodeId,
        rule_ref: RuleRef,
    },
    InstallGroup {
        node: NodeId,
        group_id: u32,
    },
    RemoveGroup {
        node: NodeId,
        group_id: u32,
    },
    Advertise {
        vpn: String,
        prefix: Ipv4Prefix,
        next_hop: Ipv4Addr,
    },
    Withdraw {
        vpn: String,
        prefix: Ipv4Prefix,
        next_hop: Ipv4Addr,
    },
    Replay {
        node: NodeId,
        len: usize,
    },
}

/// Shared, append-only journal. Clones write to the same log.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Position of the first entry matching `pred`.
    pub fn position<P>(&self, pred: P) -> Option<usize>
    where
        P: Fn(&JournalEntry) -> bool,
    {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .position(pred)
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
