//! Audit logging for control-plane decisions.
//!
//! Elections, mapping registrations and releases, role programming and
//! route changes each emit one [`AuditRecord`] through [`audit_log!`]. The
//! record is serialized to JSON and logged on the `audit` tracing target at
//! a level derived from its outcome:
//!
//! | Outcome | Level |
//! |---------|-------|
//! | Success | info |
//! | InProgress | debug |
//! | Failure | warn |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Primary node election or re-election
    Election,
    /// External address or port mapping changes
    AddressMapping,
    /// Rule and group programming on a node
    FlowProgramming,
    /// External route advertisement and withdrawal
    RouteAdvertisement,
    /// Per-connection session setup and teardown
    Session,
    /// Daemon startup and shutdown
    SystemLifecycle,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditCategory::Election => "ELECTION",
            AuditCategory::AddressMapping => "ADDRESS_MAPPING",
            AuditCategory::FlowProgramming => "FLOW_PROGRAMMING",
            AuditCategory::RouteAdvertisement => "ROUTE_ADVERTISEMENT",
            AuditCategory::Session => "SESSION",
            AuditCategory::SystemLifecycle => "SYSTEM_LIFECYCLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
        }
    }
}

/// Structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component emitting the record
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Router, node or mapping the action touched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record with the current timestamp; the outcome starts as
    /// `InProgress` until set.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as Failure.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    /// Sets success or failure from an operation result.
    pub fn with_result<T, E: fmt::Display>(self, result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => self.with_outcome(AuditOutcome::Success),
            Err(e) => self.with_error(e.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Logs an [`AuditRecord`] on the `audit` target.
///
/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::Election, "PrimarySwitchElector", "select_primary")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id("r1"));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Installs the global fmt subscriber, filtered by `RUST_LOG` or `log_level`.
pub fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).json())
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use napt_orch_common::TaskError;

    #[test]
    fn test_audit_record_creation() {
        let record = AuditRecord::new(AuditCategory::Election, "PrimarySwitchElector", "select_primary")
            .with_outcome(AuditOutcome::Success)
            .with_object_id("r1")
            .with_object_type("router");

        assert_eq!(record.category, AuditCategory::Election);
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_with_result() {
        let ok: Result<(), TaskError> = Ok(());
        let record = AuditRecord::new(AuditCategory::Session, "x", "y").with_result(&ok);
        assert_eq!(record.outcome, AuditOutcome::Success);

        let err: Result<(), TaskError> = Err(TaskError::not_found("router r9"));
        let record = AuditRecord::new(AuditCategory::Session, "x", "y").with_result(&err);
        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("Not found: router r9"));
    }

    #[test]
    fn test_audit_record_json() {
        let record = AuditRecord::new(
            AuditCategory::AddressMapping,
            "AddressPoolManager",
            "register_mapping",
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({ "external": "203.0.113.5/32" }));

        let json = record.to_json();
        assert!(json.contains("ADDRESS_MAPPING"));
        assert!(json.contains("\"external\":\"203.0.113.5/32\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_audit_display() {
        assert_eq!(AuditCategory::RouteAdvertisement.to_string(), "ROUTE_ADVERTISEMENT");
        assert_eq!(AuditOutcome::InProgress.to_string(), "in_progress");
    }
}
