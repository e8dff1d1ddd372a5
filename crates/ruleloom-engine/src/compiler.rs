//! Recursive rule tree compiler
//!
//! Every failure is contained at the node it happens in: the node compiles
//! to a no-op rule, one warning is logged, and the rest of the tree is
//! unaffected.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::warn;

use crate::describe_panic;
use crate::error::CompileError;
use crate::expr::NumericExpr;
use crate::node::Node;
use crate::platform::Subject;
use crate::registry::{Factory, Registry};
use crate::rule::{Action, ActionList, Requirement, RequirementList};

pub const TYPE_KEY: &str = "type";
pub const VALUE_KEY: &str = "value";
pub const CHANCE_KEY: &str = "chance";
pub const NOT_MET_KEY: &str = "not-met-actions";

/// Compiles configuration trees into rules using a registry
pub struct Compiler<T: Subject> {
    registry: Arc<Registry<T>>,
}

impl<T: Subject> Clone for Compiler<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

fn reject(type_key: &str, reason: impl std::fmt::Display) {
    warn!(target: "rules", "Rule '{}' disabled: {}", type_key, reason);
}

/// Log a factory error unless a nested rule already logged it
fn reject_compile(type_key: &str, error: CompileError) {
    if !matches!(error, CompileError::NestedRejected) {
        reject(type_key, error);
    }
}

impl<T: Subject> Compiler<T> {
    pub fn new(registry: Arc<Registry<T>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    /// Read the type key of a rule node, logging why it has none
    fn type_of(&self, node: &Node) -> Option<String> {
        if !matches!(node, Node::Map(_)) {
            reject("?", CompileError::shape("a rule map", node));
            return None;
        }
        match node.get_present(TYPE_KEY).and_then(Node::text) {
            Some(key) => Some(key),
            None => {
                reject("?", CompileError::MissingKey(TYPE_KEY));
                None
            }
        }
    }

    pub fn compile_action(&self, node: &Node) -> Action<T> {
        let Some(type_key) = self.type_of(node) else {
            return Action::noop("?");
        };

        let factory = match self.registry.lookup(&type_key) {
            Some(Factory::Action(factory)) => factory,
            Some(Factory::Requirement(_)) => {
                reject(&type_key, "is a requirement, expected an action");
                return Action::noop(&type_key);
            }
            None => {
                reject(&type_key, "unknown type");
                return Action::noop(&type_key);
            }
        };

        let chance = match node.get_present(CHANCE_KEY) {
            Some(chance) => match NumericExpr::from_node(chance) {
                Ok(chance) => chance,
                Err(e) => {
                    reject(&type_key, format!("invalid chance: {}", e));
                    return Action::noop(&type_key);
                }
            },
            None => NumericExpr::constant(1.0),
        };

        let value = node.get(VALUE_KEY).unwrap_or(Node::null());
        match std::panic::catch_unwind(AssertUnwindSafe(|| factory.compile(self, value))) {
            Ok(Ok(body)) => Action::new(&type_key, chance, body),
            Ok(Err(e)) => {
                reject_compile(&type_key, e);
                Action::noop(&type_key)
            }
            Err(panic) => {
                reject(&type_key, format!("factory panicked: {}", describe_panic(panic.as_ref())));
                Action::noop(&type_key)
            }
        }
    }

    /// Compile an action block: a map (declared order) or a list
    pub fn compile_actions(&self, node: &Node) -> ActionList<T> {
        match node {
            Node::Map(_) | Node::List(_) => node
                .children()
                .into_iter()
                .map(|(_, child)| self.compile_action(child))
                .collect::<Vec<_>>()
                .into(),
            _ if node.is_null() => ActionList::empty(),
            _ => {
                reject("actions", CompileError::shape("an action block", node));
                ActionList::empty()
            }
        }
    }

    /// Compile a requirement node. Its `not-met-actions` are only compiled
    /// when `run_side_effects` is set.
    pub fn compile_requirement(&self, node: &Node, run_side_effects: bool) -> Requirement<T> {
        let Some(type_key) = self.type_of(node) else {
            return Requirement::noop("?");
        };

        let factory = match self.registry.lookup(&type_key) {
            Some(Factory::Requirement(factory)) => factory,
            Some(Factory::Action(_)) => {
                reject(&type_key, "is an action, expected a requirement");
                return Requirement::noop(&type_key);
            }
            None => {
                reject(&type_key, "unknown type");
                return Requirement::noop(&type_key);
            }
        };

        let value = node.get(VALUE_KEY).unwrap_or(Node::null());
        let body = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            factory.compile(self, value, run_side_effects)
        })) {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                reject_compile(&type_key, e);
                return Requirement::noop(&type_key);
            }
            Err(panic) => {
                reject(&type_key, format!("factory panicked: {}", describe_panic(panic.as_ref())));
                return Requirement::noop(&type_key);
            }
        };

        let not_met = match node.get_present(NOT_MET_KEY) {
            Some(actions) if run_side_effects => self.compile_actions(actions),
            _ => ActionList::empty(),
        };

        Requirement::new(&type_key, body, not_met)
    }

    /// Compile a requirement block: a map (declared order) or a list
    pub fn compile_requirements(&self, node: &Node, run_side_effects: bool) -> RequirementList<T> {
        match node {
            Node::Map(_) | Node::List(_) => node
                .children()
                .into_iter()
                .map(|(_, child)| self.compile_requirement(child, run_side_effects))
                .collect::<Vec<_>>()
                .into(),
            _ if node.is_null() => RequirementList::empty(),
            _ => {
                reject("conditions", CompileError::shape("a requirement block", node));
                RequirementList::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Services};
    use crate::cooldown::CooldownLedger;
    use crate::platform::NullPlatform;
    use crate::rule::{ActionBody, RequirementBody};
    use crate::scheduler::TickScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> Context<String> {
        let services = Services::new(
            Arc::new(NullPlatform),
            Arc::new(TickScheduler::new()),
            Arc::new(CooldownLedger::new()),
        );
        Context::new(Arc::new("alice".to_string()), Arc::new(services))
    }

    fn compiler() -> (Arc<AtomicUsize>, Compiler<String>) {
        let registry = Arc::new(Registry::new());
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        registry.register(
            Factory::action(move |_, _| {
                let seen = seen.clone();
                Ok(Arc::new(move |_: &Context<String>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }) as Arc<dyn ActionBody<String>>)
            }),
            &["count"],
        );
        registry.register(
            Factory::requirement(|_, value, _| {
                let result = value.as_bool().unwrap_or(false);
                Ok(Arc::new(move |_: &Context<String>| result) as Arc<dyn RequirementBody<String>>)
            }),
            &["const"],
        );
        registry.register(
            Factory::action(|_, _| Err(CompileError::Rejected("always".into()))),
            &["broken"],
        );
        registry.register(Factory::action(|_, _| panic!("factory exploded")), &["explosive"]);

        (count, Compiler::new(registry))
    }

    #[test]
    fn test_compile_action_block_in_order() {
        let (count, compiler) = compiler();
        let node = Node::from_yaml_str("a: {type: count}\nb: {type: count}\n").unwrap();
        let actions = compiler.compile_actions(&node);
        assert_eq!(actions.len(), 2);
        actions.trigger_all(&context());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_become_noops() {
        let (_count, compiler) = compiler();
        for yaml in [
            "type: missing",
            "type: const",
            "type: broken",
            "type: explosive",
            "value: 1",
            "type: count\nchance: 'nope('",
        ] {
            let node = Node::from_yaml_str(yaml).unwrap();
            assert!(compiler.compile_action(&node).is_noop(), "{}", yaml);
        }
        assert!(compiler.compile_action(&Node::from("count")).is_noop());
    }

    #[test]
    fn test_requirement_kind_mismatch_is_noop() {
        let (_count, compiler) = compiler();
        let node = Node::from_yaml_str("type: count").unwrap();
        let requirement = compiler.compile_requirement(&node, true);
        assert!(requirement.is_noop());
        assert!(!requirement.is_met(&context(), true));
    }

    #[test]
    fn test_not_met_actions_depend_on_side_effect_flag() {
        let (count, compiler) = compiler();
        let node = Node::from_yaml_str(
            "type: const\nvalue: false\nnot-met-actions:\n  - type: count\n",
        )
        .unwrap();

        let quiet = compiler.compile_requirement(&node, false);
        assert!(quiet.not_met_actions().is_empty());

        let loud = compiler.compile_requirement(&node, true);
        assert_eq!(loud.not_met_actions().len(), 1);
        assert!(!loud.is_met(&context(), true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocks_of_other_shapes() {
        let (_count, compiler) = compiler();
        assert!(compiler.compile_actions(Node::null()).is_empty());
        assert!(compiler.compile_actions(&Node::from("count")).is_empty());
        assert!(compiler.compile_requirements(&Node::from(3_i64), true).is_empty());
    }
}
