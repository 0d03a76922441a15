//! Base Orch trait.

use async_trait::async_trait;

/// Base trait for the event-facing orchestration components.
///
/// The daemon owns every registered Orch, calls [`Orch::on_timer`] on each
/// heartbeat and collects [`Orch::dump_pending_tasks`] for debugging.
/// Actual work arrives through each component's own typed entry points; this
/// trait only covers what the daemon needs to drive them uniformly.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this Orch (for logging and debugging).
    fn name(&self) -> &str;

    /// Called periodically by the daemon's timer.
    async fn on_timer(&self) {
        // Default: no-op
    }

    /// Returns true if this Orch has queued or in-flight work.
    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Dumps pending tasks for debugging.
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }
}
