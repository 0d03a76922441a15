//! Waiting for a redirection group to become visible on a node.

use crate::services::RuleInstaller;
use crate::stats::NaptStats;
use napt_orch_common::{TaskError, TaskResult};
use napt_types::NodeId;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Resolves once `group_id` is present on `node`, or fails with
/// `DependencyExpired` after `timeout`.
///
/// The subscription is taken before the presence check so a group that
/// appears in between is not missed. Expiry is final: the caller must not
/// install the dependent rule and the error is not retryable.
pub async fn await_group(
    installer: &dyn RuleInstaller,
    stats: &NaptStats,
    node: NodeId,
    group_id: u32,
    timeout: Duration,
) -> TaskResult<()> {
    let mut events = installer.subscribe_groups();
    if installer.group_present(node, group_id) {
        return Ok(());
    }

    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.node == node && event.group_id == group_id && event.present => {
                    return true;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%node, group = group_id, skipped, "group events lagged, rechecking");
                    if installer.group_present(node, group_id) {
                        return true;
                    }
                }
                Err(RecvError::Closed) => return installer.group_present(node, group_id),
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => {
            NaptStats::incr(&stats.dependency_expired);
            warn!(
                %node,
                group = group_id,
                ?timeout,
                "redirection group never became visible, dependent rule not installed"
            );
            Err(TaskError::dependency_expired(format!("group {group_id} on {node}")))
        }
    }
}
