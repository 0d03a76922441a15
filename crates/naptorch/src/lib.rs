//! NAPT orchestration agent.
//!
//! Control plane for distributed source NAT with port translation: routers
//! are hosted on many forwarding nodes, one of which is elected primary and
//! performs translation while the others redirect to it.
//!
//! ```text
//! [NaptEvent] ──> [NaptDaemon] ──┬──> [ReconvergenceCoordinator] ──> [PrimarySwitchElector]
//!                                │              │
//!                                │              ├──> [TranslationFlowProgrammer] ──> RuleInstaller
//!                                │              └──> [RouteLedger] ──> RouteAdvertiser
//!                                └──> [TrafficEventProcessor] ──> [AddressPoolManager] ──> IdAllocator
//!                                               └──> PacketReplayer
//! ```
//!
//! # Key Components
//!
//! - [`election::PrimarySwitchElector`]: least-loaded primary per router
//! - [`pool::AddressPoolManager`]: external address associations and ports
//! - [`flows::TranslationFlowProgrammer`]: primary/secondary rule sets
//! - [`packet::TrafficEventProcessor`]: first-packet session setup
//! - [`reconverge::ReconvergenceCoordinator`]: reaction to topology changes
//! - [`daemon::NaptDaemon`]: event loop wiring them together

pub mod audit;
pub mod config;
pub mod daemon;
pub mod election;
pub mod flows;
pub mod model;
pub mod packet;
pub mod pool;
pub mod reconverge;
pub mod services;
pub mod stats;

pub use config::NaptConfig;
pub use daemon::{NaptDaemon, NaptEvent, NaptServices};
