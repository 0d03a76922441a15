//! Rule installer contract and in-memory implementation.

use super::journal::{Journal, JournalEntry};
use super::{FailureBudget, ServiceError};
use crate::flows::{ForwardingRule, RedirectionGroup, RuleRef, Table};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use napt_types::NodeId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Visibility change of a redirection group on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEvent {
    pub node: NodeId,
    pub group_id: u32,
    pub present: bool,
}

/// Idempotent install/remove of rules and groups by reference.
///
/// A group install is acknowledged before the group is necessarily visible
/// in the node's tables; [`RuleInstaller::group_present`] and the
/// [`RuleInstaller::subscribe_groups`] stream report actual visibility.
#[async_trait]
pub trait RuleInstaller: Send + Sync {
    /// Installs or replaces the rule with the same reference.
    async fn install_rule(&self, rule: &ForwardingRule) -> Result<(), ServiceError>;

    /// Removing an absent rule succeeds.
    async fn remove_rule(&self, node: NodeId, rule_ref: &RuleRef) -> Result<(), ServiceError>;

    /// Installs or replaces the group with the same id.
    async fn install_group(&self, group: &RedirectionGroup) -> Result<(), ServiceError>;

    /// Removing an absent group succeeds.
    async fn remove_group(&self, node: NodeId, group_id: u32) -> Result<(), ServiceError>;

    fn group_present(&self, node: NodeId, group_id: u32) -> bool;

    fn subscribe_groups(&self) -> broadcast::Receiver<GroupEvent>;
}

struct InstallerState {
    rules: DashMap<(NodeId, RuleRef), ForwardingRule>,
    groups: DashMap<(NodeId, u32), RedirectionGroup>,
    visible: DashSet<(NodeId, u32)>,
    events: broadcast::Sender<GroupEvent>,
}

impl InstallerState {
    fn make_visible(&self, node: NodeId, group_id: u32) {
        // Removed before the delay elapsed
        if !self.groups.contains_key(&(node, group_id)) {
            return;
        }
        self.visible.insert((node, group_id));
        // No subscribers is fine
        let _ = self.events.send(GroupEvent {
            node,
            group_id,
            present: true,
        });
    }
}

/// Installer holding rules in process.
///
/// Groups become visible immediately unless a visibility delay is set, or
/// never while groups are held (to exercise dependency expiry).
pub struct MemoryRuleInstaller {
    state: Arc<InstallerState>,
    journal: Journal,
    visibility_delay: Mutex<Duration>,
    hold_groups: Mutex<bool>,
    failing_tables: Mutex<HashSet<Table>>,
    failures: FailureBudget,
}

impl MemoryRuleInstaller {
    pub fn new() -> Self {
        Self::with_journal(Journal::new())
    }

    pub fn with_journal(journal: Journal) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(InstallerState {
                rules: DashMap::new(),
                groups: DashMap::new(),
                visible: DashSet::new(),
                events,
            }),
            journal,
            visibility_delay: Mutex::new(Duration::ZERO),
            hold_groups: Mutex::new(false),
            failing_tables: Mutex::new(HashSet::new()),
            failures: FailureBudget::default(),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn set_visibility_delay(&self, delay: Duration) {
        *self.visibility_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// While held, installed groups never become visible.
    pub fn hold_groups(&self, hold: bool) {
        *self.hold_groups.lock().unwrap_or_else(|e| e.into_inner()) = hold;
    }

    /// Makes every rule install into `table` fail until cleared.
    pub fn fail_table(&self, table: Table) {
        self.failing_tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table);
    }

    pub fn clear_failures(&self) {
        self.failing_tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.failures.arm(0);
    }

    /// Fails the next `count` rule or group installs.
    pub fn fail_next_installs(&self, count: u32) {
        self.failures.arm(count);
    }

    pub fn rule(&self, node: NodeId, rule_ref: &RuleRef) -> Option<ForwardingRule> {
        self.state
            .rules
            .get(&(node, rule_ref.clone()))
            .map(|r| r.value().clone())
    }

    /// Installed rules on `node`, ordered by reference.
    pub fn rules_on(&self, node: NodeId) -> Vec<ForwardingRule> {
        let mut rules: Vec<_> = self
            .state
            .rules
            .iter()
            .filter(|e| e.key().0 == node)
            .map(|e| e.value().clone())
            .collect();
        rules.sort_by(|a, b| a.rule_ref.cmp(&b.rule_ref));
        rules
    }

    pub fn rule_count(&self) -> usize {
        self.state.rules.len()
    }

    pub fn group(&self, node: NodeId, group_id: u32) -> Option<RedirectionGroup> {
        self.state
            .groups
            .get(&(node, group_id))
            .map(|g| g.value().clone())
    }

    pub fn groups_on(&self, node: NodeId) -> Vec<RedirectionGroup> {
        let mut groups: Vec<_> = self
            .state
            .groups
            .iter()
            .filter(|e| e.key().0 == node)
            .map(|e| e.value().clone())
            .collect();
        groups.sort_by_key(|g| g.id);
        groups
    }
}

impl Default for MemoryRuleInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleInstaller for MemoryRuleInstaller {
    async fn install_rule(&self, rule: &ForwardingRule) -> Result<(), ServiceError> {
        self.failures.check("install rule")?;
        let table_fails = self
            .failing_tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&rule.table);
        if table_fails {
            return Err(ServiceError::Unavailable(format!(
                "table {} rejected {}",
                rule.table, rule.rule_ref
            )));
        }

        self.journal.record(JournalEntry::InstallRule {
            node: rule.node,
            table: rule.table,
            rule_ref: rule.rule_ref.clone(),
        });
        self.state
            .rules
            .insert((rule.node, rule.rule_ref.clone()), rule.clone());
        Ok(())
    }

    async fn remove_rule(&self, node: NodeId, rule_ref: &RuleRef) -> Result<(), ServiceError> {
        self.journal.record(JournalEntry::RemoveRule {
            node,
            rule_ref: rule_ref.clone(),
        });
        self.state.rules.remove(&(node, rule_ref.clone()));
        Ok(())
    }

    async fn install_group(&self, group: &RedirectionGroup) -> Result<(), ServiceError> {
        self.failures.check("install group")?;
        self.journal.record(JournalEntry::InstallGroup {
            node: group.node,
            group_id: group.id,
        });
        self.state
            .groups
            .insert((group.node, group.id), group.clone());

        if *self.hold_groups.lock().unwrap_or_else(|e| e.into_inner()) {
            debug!(node = %group.node, group = group.id, "holding group visibility");
            return Ok(());
        }

        let delay = *self.visibility_delay.lock().unwrap_or_else(|e| e.into_inner());
        if delay.is_zero() {
            self.state.make_visible(group.node, group.id);
        } else {
            let state = Arc::clone(&self.state);
            let (node, group_id) = (group.node, group.id);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                state.make_visible(node, group_id);
            });
        }
        Ok(())
    }

    async fn remove_group(&self, node: NodeId, group_id: u32) -> Result<(), ServiceError> {
        self.journal
            .record(JournalEntry::RemoveGroup { node, group_id });
        self.state.groups.remove(&(node, group_id));
        if self.state.visible.remove(&(node, group_id)).is_some() {
            let _ = self.state.events.send(GroupEvent {
                node,
                group_id,
                present: false,
            });
        }
        Ok(())
    }

    fn group_present(&self, node: NodeId, group_id: u32) -> bool {
        self.state.visible.contains(&(node, group_id))
    }

    fn subscribe_groups(&self) -> broadcast::Receiver<GroupEvent> {
        self.state.events.subscribe()
    }
}
