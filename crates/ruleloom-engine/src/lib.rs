//! Configuration-driven rule engine
//!
//! Rule trees written by server admins are compiled into immutable actions
//! and requirements, then evaluated against a per-trigger [`Context`].
//! New rule types come from the built-ins in [`builtins`] or from expansion
//! artifacts installed through an [`ExpansionSource`].

use std::any::Any;

pub mod builtins;
pub mod compiler;
pub mod context;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod expr;
pub mod node;
pub mod platform;
pub mod registry;
pub mod rule;
pub mod rulebook;
pub mod scheduler;
pub mod time;

pub use compiler::Compiler;
pub use context::{Context, Services};
pub use cooldown::CooldownLedger;
pub use engine::RuleEngine;
pub use error::{CompileError, ExpansionError, ExprError, NodeError, RuleBookError};
pub use expansion::{
    install_expansions, DiscoveredArtifact, ExpansionDescriptor, ExpansionSource, InstallReport,
    InstalledExpansion,
};
pub use expr::{NumericExpr, TextExpr};
pub use node::{Node, Scalar};
pub use platform::{Location, NullPlatform, Platform, Subject};
pub use registry::{ActionFactory, Factory, Registry, RequirementFactory};
pub use rule::{Action, ActionBody, ActionList, Requirement, RequirementBody, RequirementList};
pub use rulebook::{EventRules, RuleBook};
pub use scheduler::{ExecMode, Scheduler, TaskId, TickScheduler, DEFAULT_TICK_INTERVAL};

/// Render a caught panic payload for logging
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
