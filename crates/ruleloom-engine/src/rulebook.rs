//! Event-indexed rule sets
//!
//! A rule book is the top level of a rule file:
//!
//! ```yaml
//! island-join:
//!   conditions:
//!     - type: cooldown
//!       value: {key: welcome, seconds: 60}
//!   actions:
//!     - type: message
//!       value: "Welcome back, %player_name%"
//! ```

use std::path::Path;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::compiler::Compiler;
use crate::context::Context;
use crate::engine::guard;
use crate::error::{CompileError, RuleBookError};
use crate::node::Node;
use crate::platform::Subject;
use crate::rule::{ActionList, RequirementList};

/// Compiled rules of one event
pub struct EventRules<T: Subject> {
    pub conditions: RequirementList<T>,
    pub actions: ActionList<T>,
}

impl<T: Subject> Clone for EventRules<T> {
    fn clone(&self) -> Self {
        Self {
            conditions: self.conditions.clone(),
            actions: self.actions.clone(),
        }
    }
}

/// Rules keyed by event name, compiled once
pub struct RuleBook<T: Subject> {
    events: IndexMap<String, EventRules<T>>,
}

impl<T: Subject> RuleBook<T> {
    /// Compile a rule book tree. Only a non-map root is an error; bad
    /// events are logged and left out.
    pub fn compile(compiler: &Compiler<T>, root: &Node) -> Result<Self, CompileError> {
        let Node::Map(entries) = root else {
            return Err(CompileError::shape("a map of events", root));
        };

        let mut events = IndexMap::with_capacity(entries.len());
        for (name, entry) in entries {
            if !matches!(entry, Node::Map(_)) {
                warn!(
                    target: "rules",
                    "Event '{}' skipped: expected a map with conditions and actions, found a {}",
                    name,
                    entry.shape()
                );
                continue;
            }
            let conditions = entry.get("conditions").unwrap_or(Node::null());
            let actions = entry.get("actions").unwrap_or(Node::null());
            events.insert(
                name.clone(),
                EventRules {
                    conditions: compiler.compile_requirements(conditions, true),
                    actions: compiler.compile_actions(actions),
                },
            );
        }

        debug!(target: "rules", "Compiled rule book with {} event(s)", events.len());
        Ok(Self { events })
    }

    pub fn from_yaml_str(compiler: &Compiler<T>, text: &str) -> Result<Self, RuleBookError> {
        let root = Node::from_yaml_str(text)?;
        Ok(Self::compile(compiler, &root)?)
    }

    pub fn from_file(compiler: &Compiler<T>, path: &Path) -> Result<Self, RuleBookError> {
        let root = Node::load(path)?;
        Ok(Self::compile(compiler, &root)?)
    }

    pub fn get(&self, event: &str) -> Option<&EventRules<T>> {
        self.events.get(event)
    }

    /// Event names in declared order
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Evaluate the conditions of `event` with side effects and run its
    /// actions when they hold. Returns whether the actions ran.
    pub fn fire(&self, event: &str, ctx: &Context<T>) -> bool {
        let Some(rules) = self.events.get(event) else {
            debug!(target: "rules", "No rules for event '{}'", event);
            return false;
        };

        guard(event, false, || {
            if rules.conditions.all_met(ctx, true) {
                rules.actions.trigger_all(ctx);
                true
            } else {
                false
            }
        })
    }
}
