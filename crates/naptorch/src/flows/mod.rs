//! Forwarding rules implementing translation and redirection.

mod dependency;
mod mode;
mod programmer;
pub mod session;
mod types;

pub use dependency::await_group;
pub use mode::{
    ConntrackMode, ControllerRewriteMode, CrossDomainMode, FlowContext, ModeKind, RouterPlan,
    TranslationMode, GROUP_POOL, VNI_POOL, ZONE_POOL,
};
pub use programmer::TranslationFlowProgrammer;
pub use session::Session;
pub use types::{
    Action, Bucket, CtNat, CtState, ForwardingRule, GroupKind, MatchField, RedirectionGroup,
    RuleRef, Table, COOKIE_NAPT_BASE, PRIORITY_DEFAULT, PRIORITY_MISS, PRIORITY_SESSION,
    PRIORITY_TRANSLATION,
};
