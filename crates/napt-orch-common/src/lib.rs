//! Common orchestration plumbing for the NAPT control plane.
//!
//! - [`TaskStatus`] / [`TaskError`]: success/failure plus reason code for
//!   every operation the control plane exposes
//! - [`RetryPolicy`]: bounded retry with linear backoff
//! - [`KeyedWorkQueue`]: per-key serialized execution on a bounded pool
//! - [`SyncMap`]: reference counted map that never auto-vivifies entries
//! - [`Orch`]: what the daemon needs to drive a component uniformly
//!
//! # Example
//!
//! ```ignore
//! use napt_orch_common::{KeyedWorkQueue, RetryPolicy, TaskError};
//!
//! let routers: KeyedWorkQueue<String> = KeyedWorkQueue::new("router", 16, RetryPolicy::default());
//!
//! // Runs after any earlier work queued for "r1", retried while transient.
//! let ticket = routers.submit("r1".to_string(), "tep-removed", move || async move {
//!     reelect("r1").await.map_err(|e| TaskError::transient(e.to_string()))
//! });
//! ticket.wait().await?;
//! ```

mod keyed_queue;
mod orch;
mod retry;
mod sync_map;
mod task;

pub use keyed_queue::{BoxFuture, KeyedWorkQueue, Ticket};
pub use orch::Orch;
pub use retry::{is_terminal, RetryPolicy};
pub use sync_map::{HasRefCount, RefCounter, SyncMap, SyncMapError};
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
