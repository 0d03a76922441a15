//! Collaborator contracts consumed by the control plane.
//!
//! Each contract is an `async_trait` the components hold as `Arc<dyn ...>`.
//! Synchronous methods are cheap local reads; anything that would be a
//! datastore write or an RPC is `async` and may fail with [`ServiceError`].
//!
//! The `Memory*` implementations keep everything in process. They back the
//! daemon's simulation mode and the tests, record an ordered [`Journal`] of
//! side effects and support failure injection.

mod allocator;
mod installer;
mod journal;
mod replay;
mod routes;
mod topology;

pub use allocator::{IdAllocator, MemoryIdAllocator};
pub use installer::{GroupEvent, MemoryRuleInstaller, RuleInstaller};
pub use journal::{Journal, JournalEntry};
pub use replay::{MemoryPacketReplayer, PacketReplayer};
pub use routes::{ExternalRoute, MemoryRouteAdvertiser, RouteAdvertiser, RouteOrigin};
pub use topology::{MemoryTopology, TopologyStore};

use napt_orch_common::TaskError;
use thiserror::Error;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl From<ServiceError> for TaskError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound(what) => TaskError::not_found(what),
            other => TaskError::transient(other.to_string()),
        }
    }
}

/// Countdown used by the memory collaborators to fail the next N writes.
#[derive(Debug, Default)]
pub(crate) struct FailureBudget(std::sync::atomic::AtomicU32);

impl FailureBudget {
    pub(crate) fn arm(&self, count: u32) {
        self.0.store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns an error if a failure is still armed, consuming it.
    pub(crate) fn check(&self, what: &str) -> Result<(), ServiceError> {
        use std::sync::atomic::Ordering;
        let taken = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(ServiceError::Unavailable(format!("injected failure on {what}"))),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use napt_orch_common::TaskStatus;

    #[test]
    fn test_service_error_conversion() {
        let e: TaskError = ServiceError::Unavailable("store".into()).into();
        assert_eq!(e.to_status(), TaskStatus::NeedRetry);

        let e: TaskError = ServiceError::NotFound("pool 203.0.113.5".into()).into();
        assert_eq!(e.to_status(), TaskStatus::NotFound);

        let e: TaskError = ServiceError::Rejected("bad rule".into()).into();
        assert!(e.is_retryable());
    }

    #[test]
    fn test_failure_budget() {
        let budget = FailureBudget::default();
        assert!(budget.check("x").is_ok());

        budget.arm(2);
        assert!(budget.check("x").is_err());
        assert!(budget.check("x").is_err());
        assert!(budget.check("x").is_ok());
    }
}
