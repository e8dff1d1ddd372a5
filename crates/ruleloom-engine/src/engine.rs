use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::builtins::register_builtins;
use crate::compiler::Compiler;
use crate::context::{Context, Services};
use crate::cooldown::CooldownLedger;
use crate::describe_panic;
use crate::error::{CompileError, RuleBookError};
use crate::expansion::{install_expansions, ExpansionSource, InstallReport};
use crate::node::Node;
use crate::platform::{Platform, Subject};
use crate::registry::Registry;
use crate::rule::{ActionList, RequirementList};
use crate::rulebook::RuleBook;
use crate::scheduler::Scheduler;

/// Run `f`, turning a panic into a logged error and `fallback`
pub(crate) fn guard<R>(what: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            error!(
                target: "rules",
                "Rule evaluation for '{}' panicked: {}",
                what,
                describe_panic(panic.as_ref())
            );
            fallback
        }
    }
}

/// Entry point for one subject domain.
///
/// Owns the type registry (built-ins pre-registered) and the services every
/// context of the domain shares.
pub struct RuleEngine<T: Subject> {
    registry: Arc<Registry<T>>,
    compiler: Compiler<T>,
    services: Arc<Services<T>>,
}

impl<T: Subject> RuleEngine<T> {
    pub fn new(platform: Arc<dyn Platform<T>>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_services(Services::new(
            platform,
            scheduler,
            Arc::new(CooldownLedger::new()),
        ))
    }

    pub fn with_services(services: Services<T>) -> Self {
        let registry = Arc::new(Registry::new());
        let count = register_builtins(&registry);
        info!(target: "rules", "Rule engine ready with {} built-in type(s)", count);

        Self {
            compiler: Compiler::new(registry.clone()),
            registry,
            services: Arc::new(services),
        }
    }

    pub fn compiler(&self) -> &Compiler<T> {
        &self.compiler
    }

    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<Services<T>> {
        &self.services
    }

    /// A fresh context for a trigger owned by `subject`
    pub fn context(&self, subject: impl Into<Arc<T>>) -> Context<T> {
        Context::new(subject.into(), self.services.clone())
    }

    pub fn compile_actions(&self, node: &Node) -> ActionList<T> {
        self.compiler.compile_actions(node)
    }

    pub fn compile_requirements(&self, node: &Node, run_side_effects: bool) -> RequirementList<T> {
        self.compiler.compile_requirements(node, run_side_effects)
    }

    /// Trigger `actions`; a panicking rule is logged and ends the trigger
    pub fn trigger(&self, ctx: &Context<T>, actions: &ActionList<T>) {
        guard("trigger", (), || actions.trigger_all(ctx))
    }

    /// Evaluate `requirements`; a panicking rule counts as not satisfied
    pub fn is_satisfied(
        &self,
        ctx: &Context<T>,
        requirements: &RequirementList<T>,
        side_effects: bool,
    ) -> bool {
        guard("requirements", false, || requirements.all_met(ctx, side_effects))
    }

    pub fn load_rule_book(&self, root: &Node) -> Result<RuleBook<T>, CompileError> {
        RuleBook::compile(&self.compiler, root)
    }

    pub fn load_rule_book_file(&self, path: &Path) -> Result<RuleBook<T>, RuleBookError> {
        RuleBook::from_file(&self.compiler, path)
    }

    /// Forget everything the engine keeps for a subject whose session ended
    pub fn end_session(&self, subject: &T) -> usize {
        self.services.cooldowns().end_session(&subject.id())
    }

    pub fn install_expansions(
        &self,
        source: &dyn ExpansionSource<T>,
        dir: &Path,
    ) -> InstallReport<T> {
        install_expansions(&self.registry, source, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullPlatform;
    use crate::registry::Factory;
    use crate::rule::ActionBody;
    use crate::scheduler::TickScheduler;
    use std::time::Duration;

    fn engine() -> RuleEngine<String> {
        RuleEngine::new(Arc::new(NullPlatform), Arc::new(TickScheduler::new()))
    }

    #[test]
    fn test_builtins_preregistered() {
        let engine = engine();
        assert!(engine.registry().contains("priority"));
        assert!(engine.registry().contains("message"));
    }

    #[test]
    fn test_trigger_contains_panics() {
        let engine = engine();
        engine.registry().register(
            Factory::action(|_, _| {
                Ok(Arc::new(|_: &Context<String>| {
                    panic!("rule exploded");
                }) as Arc<dyn ActionBody<String>>)
            }),
            &["explode"],
        );

        let actions = engine.compile_actions(&Node::from_yaml_str("- type: explode").unwrap());
        let ctx = engine.context("alice".to_string());
        engine.trigger(&ctx, &actions);
    }

    #[test]
    fn test_end_session_clears_cooldowns() {
        let engine = engine();
        let subject = "alice".to_string();
        engine
            .services()
            .cooldowns()
            .is_in_cooldown(&subject, "k", Duration::from_secs(60));
        assert_eq!(engine.end_session(&subject), 1);
        assert_eq!(engine.end_session(&subject), 0);
    }

    #[test]
    fn test_is_satisfied_with_empty_list() {
        let engine = engine();
        let ctx = engine.context("alice".to_string());
        assert!(engine.is_satisfied(&ctx, &RequirementList::empty(), true));
    }
}
