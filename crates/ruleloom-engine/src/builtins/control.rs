//! Control-flow rule types: sequencing, deferral, repetition, branching
//! and boolean combinators

use std::sync::Arc;

use tracing::trace;

use crate::compiler::Compiler;
use crate::context::Context;
use crate::error::CompileError;
use crate::node::Node;
use crate::platform::Subject;
use crate::registry::Factory;
use crate::rule::{ActionBody, ActionList, Requirement, RequirementBody, RequirementList};
use crate::scheduler::{ExecMode, RepeatingTask};

pub const CHAIN: &str = "chain";
pub const DELAY: &str = "delay";
pub const TIMER: &str = "timer";
pub const CONDITIONAL: &str = "conditional";
pub const PRIORITY: &str = "priority";
pub const AND: &str = "&&";
pub const OR: &str = "||";
pub const NOT: &str = "!";

/// Read a non-negative tick count, falling back to `default` when absent
fn ticks(value: &Node, key: &'static str, default: Option<u64>) -> Result<u64, CompileError> {
    match value.get_present(key) {
        Some(node) => match node.as_i64() {
            Some(n) if n >= 0 => Ok(n as u64),
            _ => Err(CompileError::invalid(key, "expected a non-negative tick count")),
        },
        None => default.ok_or(CompileError::MissingKey(key)),
    }
}

fn exec_mode(value: &Node) -> Result<ExecMode, CompileError> {
    match value.get_present("async") {
        Some(node) => node
            .as_bool()
            .map(ExecMode::from_async_flag)
            .ok_or_else(|| CompileError::invalid("async", "expected a boolean")),
        None => Ok(ExecMode::Sync),
    }
}

fn expect_map(value: &Node) -> Result<(), CompileError> {
    match value {
        Node::Map(_) => Ok(()),
        other => Err(CompileError::shape("a map", other)),
    }
}

fn nested_actions<T: Subject>(compiler: &Compiler<T>, value: &Node) -> ActionList<T> {
    compiler.compile_actions(value.get("actions").unwrap_or(Node::null()))
}

fn nested_conditions<T: Subject>(compiler: &Compiler<T>, value: &Node) -> RequirementList<T> {
    compiler.compile_requirements(value.get("conditions").unwrap_or(Node::null()), false)
}

struct Chain<T: Subject> {
    actions: ActionList<T>,
}

impl<T: Subject> ActionBody<T> for Chain<T> {
    fn run(&self, ctx: &Context<T>) {
        self.actions.trigger_all(ctx);
    }
}

struct Delay<T: Subject> {
    delay: u64,
    mode: ExecMode,
    actions: ActionList<T>,
}

impl<T: Subject> ActionBody<T> for Delay<T> {
    fn run(&self, ctx: &Context<T>) {
        let actions = self.actions.clone();
        let deferred = ctx.clone();
        let id = ctx.scheduler().schedule(
            self.delay,
            self.mode,
            Box::new(move || actions.trigger_all(&deferred)),
        );
        trace!(
            target: "scheduler",
            "Delayed {} action(s) by {} tick(s) as {:?}",
            self.actions.len(),
            self.delay,
            id
        );
    }
}

struct Timer<T: Subject> {
    delay: u64,
    period: u64,
    duration: u64,
    mode: ExecMode,
    actions: ActionList<T>,
}

impl<T: Subject> ActionBody<T> for Timer<T> {
    fn run(&self, ctx: &Context<T>) {
        let actions = self.actions.clone();
        let repeating = ctx.clone();
        let task: RepeatingTask = Arc::new(move || actions.trigger_all(&repeating));

        let scheduler = ctx.scheduler().clone();
        let id = scheduler.schedule_repeating(self.delay, self.period, self.mode, task);

        // Scheduled after the repeating task, so a firing due on the same
        // tick runs before it is cancelled
        let canceller = scheduler.clone();
        scheduler.schedule(
            self.duration,
            ExecMode::Sync,
            Box::new(move || {
                canceller.cancel(id);
            }),
        );
        trace!(
            target: "scheduler",
            "Timer {:?}: every {} tick(s) for {} tick(s)",
            id,
            self.period,
            self.duration
        );
    }
}

struct Conditional<T: Subject> {
    conditions: RequirementList<T>,
    actions: ActionList<T>,
}

impl<T: Subject> ActionBody<T> for Conditional<T> {
    fn run(&self, ctx: &Context<T>) {
        if self.conditions.all_met(ctx, false) {
            self.actions.trigger_all(ctx);
        }
    }
}

struct Priority<T: Subject> {
    branches: Vec<(String, Conditional<T>)>,
}

impl<T: Subject> ActionBody<T> for Priority<T> {
    fn run(&self, ctx: &Context<T>) {
        for (name, branch) in &self.branches {
            if branch.conditions.all_met(ctx, false) {
                trace!(target: "rules", "Priority branch '{}' selected", name);
                branch.actions.trigger_all(ctx);
                return;
            }
        }
    }
}

struct All<T: Subject> {
    children: RequirementList<T>,
}

impl<T: Subject> RequirementBody<T> for All<T> {
    fn check(&self, ctx: &Context<T>, side_effects: bool) -> bool {
        self.children.all_met(ctx, side_effects)
    }
}

struct Any<T: Subject> {
    children: RequirementList<T>,
}

impl<T: Subject> RequirementBody<T> for Any<T> {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        self.children.any_met(ctx)
    }
}

struct Not<T: Subject> {
    inner: Requirement<T>,
}

impl<T: Subject> RequirementBody<T> for Not<T> {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        !self.inner.is_met(ctx, false)
    }
}

pub(crate) fn register<T: Subject>(factories: &mut Vec<(&'static str, Factory<T>)>) {
    factories.push((
        CHAIN,
        Factory::action(|compiler, value| {
            Ok(Arc::new(Chain {
                actions: compiler.compile_actions(value),
            }))
        }),
    ));

    factories.push((
        DELAY,
        Factory::action(|compiler, value| {
            expect_map(value)?;
            Ok(Arc::new(Delay {
                delay: ticks(value, "delay", Some(0))?,
                mode: exec_mode(value)?,
                actions: nested_actions(compiler, value),
            }))
        }),
    ));

    factories.push((
        TIMER,
        Factory::action(|compiler, value| {
            expect_map(value)?;
            let period = ticks(value, "period", None)?;
            if period == 0 {
                return Err(CompileError::invalid("period", "must be at least 1 tick"));
            }
            Ok(Arc::new(Timer {
                delay: ticks(value, "delay", Some(0))?,
                period,
                duration: ticks(value, "duration", None)?,
                mode: exec_mode(value)?,
                actions: nested_actions(compiler, value),
            }))
        }),
    ));

    factories.push((
        CONDITIONAL,
        Factory::action(|compiler, value| {
            expect_map(value)?;
            Ok(Arc::new(Conditional {
                conditions: nested_conditions(compiler, value),
                actions: nested_actions(compiler, value),
            }))
        }),
    ));

    factories.push((
        PRIORITY,
        Factory::action(|compiler, value| {
            expect_map(value)?;
            let mut branches = Vec::new();
            for (name, branch) in value.children() {
                if !matches!(branch, Node::Map(_)) {
                    let reason = format!(
                        "expected a map of conditions and actions, found a {}",
                        branch.shape()
                    );
                    return Err(CompileError::invalid(name, reason));
                }
                branches.push((
                    name,
                    Conditional {
                        conditions: nested_conditions(compiler, branch),
                        actions: nested_actions(compiler, branch),
                    },
                ));
            }
            Ok(Arc::new(Priority { branches }))
        }),
    ));

    factories.push((
        AND,
        Factory::requirement(|compiler, value, run_side_effects| {
            Ok(Arc::new(All {
                children: compiler.compile_requirements(value, run_side_effects),
            }))
        }),
    ));

    factories.push((
        OR,
        Factory::requirement(|compiler, value, _| {
            Ok(Arc::new(Any {
                children: compiler.compile_requirements(value, false),
            }))
        }),
    ));

    factories.push((
        NOT,
        Factory::requirement(|compiler, value, _| {
            let inner = compiler.compile_requirement(value, false);
            if inner.is_noop() {
                return Err(CompileError::NestedRejected);
            }
            Ok(Arc::new(Not { inner }))
        }),
    ));
}
