//! Compiled rules and their evaluation
//!
//! A compiled rule is an immutable value: it closes over data produced at
//! compile time and reads everything else from the [`Context`] it is
//! triggered with. Rules are cheap to clone and can be handed to scheduler
//! threads.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::expr::NumericExpr;
use crate::platform::Subject;

/// Executable part of an action
pub trait ActionBody<T: Subject>: Send + Sync {
    fn run(&self, ctx: &Context<T>);
}

impl<T, F> ActionBody<T> for F
where
    T: Subject,
    F: Fn(&Context<T>) + Send + Sync,
{
    fn run(&self, ctx: &Context<T>) {
        self(ctx)
    }
}

/// Predicate part of a requirement.
///
/// `side_effects` tells combinators whether their children may fire
/// not-met actions; plain predicates ignore it.
pub trait RequirementBody<T: Subject>: Send + Sync {
    fn check(&self, ctx: &Context<T>, side_effects: bool) -> bool;
}

impl<T, F> RequirementBody<T> for F
where
    T: Subject,
    F: Fn(&Context<T>) -> bool + Send + Sync,
{
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        self(ctx)
    }
}

struct NoopAction;

impl<T: Subject> ActionBody<T> for NoopAction {
    fn run(&self, _ctx: &Context<T>) {}
}

struct NoopRequirement;

impl<T: Subject> RequirementBody<T> for NoopRequirement {
    fn check(&self, _ctx: &Context<T>, _side_effects: bool) -> bool {
        false
    }
}

/// A compiled side-effecting rule
pub struct Action<T: Subject> {
    type_key: Arc<str>,
    chance: NumericExpr,
    body: Arc<dyn ActionBody<T>>,
    noop: bool,
}

impl<T: Subject> Clone for Action<T> {
    fn clone(&self) -> Self {
        Self {
            type_key: self.type_key.clone(),
            chance: self.chance.clone(),
            body: self.body.clone(),
            noop: self.noop,
        }
    }
}

impl<T: Subject> Action<T> {
    pub fn new(type_key: &str, chance: NumericExpr, body: Arc<dyn ActionBody<T>>) -> Self {
        Self {
            type_key: type_key.into(),
            chance,
            body,
            noop: false,
        }
    }

    /// An action that does nothing, produced for nodes that failed to
    /// compile
    pub fn noop(type_key: &str) -> Self {
        Self {
            type_key: type_key.into(),
            chance: NumericExpr::constant(1.0),
            body: Arc::new(NoopAction),
            noop: true,
        }
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn chance(&self) -> &NumericExpr {
        &self.chance
    }

    pub fn is_noop(&self) -> bool {
        self.noop
    }

    /// Roll the chance and run the body if the roll passes
    pub fn trigger(&self, ctx: &Context<T>) {
        if self.chance.constant_value() != Some(1.0) {
            let chance = self.chance.eval(ctx);
            if !(chance >= 1.0) {
                let roll = ctx.roll_chance();
                if !(roll < chance) {
                    trace!(
                        target: "rules",
                        "'{}' skipped: rolled {:.3} against {}",
                        self.type_key,
                        roll,
                        chance
                    );
                    return;
                }
            }
        }

        self.body.run(ctx);
    }
}

impl<T: Subject> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("type_key", &self.type_key)
            .field("chance", &self.chance)
            .field("noop", &self.noop)
            .finish()
    }
}

/// A compiled predicate with optional not-met actions
pub struct Requirement<T: Subject> {
    type_key: Arc<str>,
    body: Arc<dyn RequirementBody<T>>,
    not_met: ActionList<T>,
    noop: bool,
}

impl<T: Subject> Clone for Requirement<T> {
    fn clone(&self) -> Self {
        Self {
            type_key: self.type_key.clone(),
            body: self.body.clone(),
            not_met: self.not_met.clone(),
            noop: self.noop,
        }
    }
}

impl<T: Subject> Requirement<T> {
    pub fn new(type_key: &str, body: Arc<dyn RequirementBody<T>>, not_met: ActionList<T>) -> Self {
        Self {
            type_key: type_key.into(),
            body,
            not_met,
            noop: false,
        }
    }

    /// A requirement that is never satisfied and never fires anything
    pub fn noop(type_key: &str) -> Self {
        Self {
            type_key: type_key.into(),
            body: Arc::new(NoopRequirement),
            not_met: ActionList::empty(),
            noop: true,
        }
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn not_met_actions(&self) -> &ActionList<T> {
        &self.not_met
    }

    pub fn is_noop(&self) -> bool {
        self.noop
    }

    /// Evaluate the predicate, firing the not-met actions against the same
    /// context when it fails and `side_effects` is set
    pub fn is_met(&self, ctx: &Context<T>, side_effects: bool) -> bool {
        let met = self.body.check(ctx, side_effects);
        if !met && side_effects && !self.not_met.is_empty() {
            trace!(
                target: "rules",
                "'{}' not met, firing {} action(s)",
                self.type_key,
                self.not_met.len()
            );
            self.not_met.trigger_all(ctx);
        }
        met
    }
}

impl<T: Subject> fmt::Debug for Requirement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirement")
            .field("type_key", &self.type_key)
            .field("not_met", &self.not_met.len())
            .field("noop", &self.noop)
            .finish()
    }
}

/// Ordered, immutable sequence of actions
pub struct ActionList<T: Subject>(Arc<[Action<T>]>);

impl<T: Subject> Clone for ActionList<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Subject> ActionList<T> {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action<T>> {
        self.0.iter()
    }

    /// Trigger every action in declared order
    pub fn trigger_all(&self, ctx: &Context<T>) {
        for action in self.0.iter() {
            action.trigger(ctx);
        }
    }
}

impl<T: Subject> From<Vec<Action<T>>> for ActionList<T> {
    fn from(actions: Vec<Action<T>>) -> Self {
        Self(actions.into())
    }
}

impl<T: Subject> fmt::Debug for ActionList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// Ordered, immutable sequence of requirements
pub struct RequirementList<T: Subject>(Arc<[Requirement<T>]>);

impl<T: Subject> Clone for RequirementList<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Subject> RequirementList<T> {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Requirement<T>> {
        self.0.iter()
    }

    /// Whether every requirement holds. Stops at the first failure; only
    /// that failure's not-met actions can fire.
    pub fn all_met(&self, ctx: &Context<T>, side_effects: bool) -> bool {
        self.0.iter().all(|requirement| requirement.is_met(ctx, side_effects))
    }

    /// Whether at least one requirement holds, evaluated without side
    /// effects
    pub fn any_met(&self, ctx: &Context<T>) -> bool {
        self.0.iter().any(|requirement| requirement.is_met(ctx, false))
    }
}

impl<T: Subject> From<Vec<Requirement<T>>> for RequirementList<T> {
    fn from(requirements: Vec<Requirement<T>>) -> Self {
        Self(requirements.into())
    }
}

impl<T: Subject> fmt::Debug for RequirementList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::cooldown::CooldownLedger;
    use crate::platform::NullPlatform;
    use crate::scheduler::TickScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(seed: u64) -> Context<String> {
        let services = Services::new(
            Arc::new(NullPlatform),
            Arc::new(TickScheduler::new()),
            Arc::new(CooldownLedger::new()),
        )
        .with_seed(seed);
        Context::new(Arc::new("alice".to_string()), Arc::new(services))
    }

    fn counting_action(chance: NumericExpr) -> (Arc<AtomicUsize>, Action<String>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let action = Action::new(
            "count",
            chance,
            Arc::new(move |_ctx: &Context<String>| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (count, action)
    }

    #[test]
    fn test_certain_and_impossible_chances() {
        let ctx = context(1);
        let (always, action) = counting_action(NumericExpr::constant(1.0));
        let (never, skipped) = counting_action(NumericExpr::constant(0.0));

        for _ in 0..50 {
            action.trigger(&ctx);
            skipped.trigger(&ctx);
        }

        assert_eq!(always.load(Ordering::SeqCst), 50);
        assert_eq!(never.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nan_chance_never_runs() {
        let ctx = context(2);
        let (count, action) = counting_action(NumericExpr::compile("{missing}").unwrap());
        for _ in 0..20 {
            action.trigger(&ctx);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_partial_chance_is_roughly_proportional() {
        let ctx = context(3);
        let (count, action) = counting_action(NumericExpr::constant(0.5));
        for _ in 0..2000 {
            action.trigger(&ctx);
        }
        let hits = count.load(Ordering::SeqCst);
        assert!((800..1200).contains(&hits), "got {} hits", hits);
    }

    #[test]
    fn test_noop_rules() {
        let ctx = context(4);
        Action::<String>::noop("broken").trigger(&ctx);
        let requirement = Requirement::<String>::noop("broken");
        assert!(requirement.is_noop());
        assert!(!requirement.is_met(&ctx, true));
    }

    #[test]
    fn test_not_met_actions_fire_only_with_side_effects() {
        let ctx = context(5);
        let (count, on_fail) = counting_action(NumericExpr::constant(1.0));
        let requirement = Requirement::new(
            "never",
            Arc::new(|_ctx: &Context<String>| false),
            ActionList::from(vec![on_fail]),
        );

        assert!(!requirement.is_met(&ctx, false));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!requirement.is_met(&ctx, true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_met_stops_at_first_failure() {
        let ctx = context(6);
        let evaluated = Arc::new(AtomicUsize::new(0));
        let make = |result: bool| {
            let evaluated = evaluated.clone();
            Requirement::new(
                "counted",
                Arc::new(move |_ctx: &Context<String>| {
                    evaluated.fetch_add(1, Ordering::SeqCst);
                    result
                }),
                ActionList::empty(),
            )
        };

        let list = RequirementList::from(vec![make(true), make(false), make(true)]);
        assert!(!list.all_met(&ctx, true));
        assert_eq!(evaluated.load(Ordering::SeqCst), 2);
        assert!(RequirementList::<String>::empty().all_met(&ctx, true));
    }
}
