//! Small general-purpose rule types: messaging, commands, properties,
//! comparisons, cooldowns and random rolls

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::context::Context;
use crate::error::CompileError;
use crate::expr::{NumericExpr, TextExpr};
use crate::node::{Node, Scalar};
use crate::platform::Subject;
use crate::registry::Factory;
use crate::rule::RequirementBody;

pub const MESSAGE: &str = "message";
pub const COMMAND: &str = "command";
pub const SET: &str = "set";
pub const EQ: &str = "==";
pub const NE: &str = "!=";
pub const GT: &str = ">";
pub const GE: &str = ">=";
pub const LT: &str = "<";
pub const LE: &str = "<=";
pub const COOLDOWN: &str = "cooldown";
pub const CHANCE: &str = "chance";

/// One side of a comparison
struct Operand {
    text: TextExpr,
    numeric: Option<NumericExpr>,
}

impl Operand {
    fn from_node(node: &Node, side: &'static str) -> Result<Self, CompileError> {
        match node {
            Node::Scalar(Scalar::Int(_)) | Node::Scalar(Scalar::Float(_)) => Ok(Self {
                text: TextExpr::from_node(node)?,
                numeric: Some(NumericExpr::from_node(node)?),
            }),
            Node::Scalar(Scalar::Str(s)) => Ok(Self {
                text: TextExpr::compile(s)?,
                numeric: NumericExpr::compile(s).ok(),
            }),
            Node::Scalar(Scalar::Bool(_)) => Ok(Self {
                text: TextExpr::from_node(node)?,
                numeric: None,
            }),
            Node::Scalar(Scalar::Null) => Err(CompileError::MissingKey(side)),
            other => Err(CompileError::shape("a scalar operand", other)),
        }
    }

    fn number<T: Subject>(&self, ctx: &Context<T>) -> Option<f64> {
        self.numeric
            .as_ref()
            .map(|expr| expr.eval(ctx))
            .filter(|value| !value.is_nan())
    }
}

fn operands(value: &Node) -> Result<(Operand, Operand), CompileError> {
    match value {
        Node::Map(_) => Ok((
            Operand::from_node(value.get("left").unwrap_or(Node::null()), "left")?,
            Operand::from_node(value.get("right").unwrap_or(Node::null()), "right")?,
        )),
        Node::List(items) if items.len() == 2 => Ok((
            Operand::from_node(&items[0], "left")?,
            Operand::from_node(&items[1], "right")?,
        )),
        Node::List(items) => Err(CompileError::invalid(
            "value",
            format!("expected two operands, found {}", items.len()),
        )),
        other => Err(CompileError::shape("a map or a list of two operands", other)),
    }
}

#[derive(Debug, Clone, Copy)]
enum Relation {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl Relation {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Relation::Greater => left > right,
            Relation::GreaterOrEqual => left >= right,
            Relation::Less => left < right,
            Relation::LessOrEqual => left <= right,
        }
    }
}

struct Equality {
    left: Operand,
    right: Operand,
    negate: bool,
}

impl<T: Subject> RequirementBody<T> for Equality {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        let equal = match (self.left.number(ctx), self.right.number(ctx)) {
            (Some(left), Some(right)) => left == right,
            _ => self.left.text.render(ctx) == self.right.text.render(ctx),
        };
        equal != self.negate
    }
}

struct Comparison {
    left: NumericExpr,
    right: NumericExpr,
    ordering: Relation,
}

impl<T: Subject> RequirementBody<T> for Comparison {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        self.ordering.holds(self.left.eval(ctx), self.right.eval(ctx))
    }
}

fn equality<T: Subject>(negate: bool) -> Factory<T> {
    Factory::requirement(move |_, value, _| {
        let (left, right) = operands(value)?;
        Ok(Arc::new(Equality {
            left,
            right,
            negate,
        }))
    })
}

fn comparison<T: Subject>(ordering: Relation) -> Factory<T> {
    Factory::requirement(move |_, value, _| {
        let (left, right) = operands(value)?;
        let numeric = |operand: Operand, side: &'static str| {
            operand
                .numeric
                .ok_or_else(|| CompileError::invalid(side, "expected a numeric expression"))
        };
        Ok(Arc::new(Comparison {
            left: numeric(left, "left")?,
            right: numeric(right, "right")?,
            ordering,
        }))
    })
}

struct Cooldown {
    key: TextExpr,
    window: NumericExpr,
    millis_per_unit: f64,
}

impl<T: Subject> RequirementBody<T> for Cooldown {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        let window = self.window.eval(ctx) * self.millis_per_unit;
        if !(window >= 0.0) {
            trace!(
                target: "cooldown",
                "Cooldown window for '{}' is not a number",
                self.key.source()
            );
            return false;
        }
        let key = self.key.render(ctx);
        !ctx.cooldowns()
            .is_in_cooldown(&ctx.subject().id(), &key, Duration::from_millis(window as u64))
    }
}

fn compile_cooldown(value: &Node) -> Result<Cooldown, CompileError> {
    if !matches!(value, Node::Map(_)) {
        return Err(CompileError::shape("a map", value));
    }
    let key = value
        .get_present("key")
        .ok_or(CompileError::MissingKey("key"))?;
    let key = TextExpr::from_node(key)?;
    let seconds = value.get_present("seconds");
    let millis = value.get_present("millis");
    let (window, millis_per_unit) = match (seconds, millis) {
        (Some(seconds), None) => (NumericExpr::from_node(seconds)?, 1000.0),
        (None, Some(millis)) => (NumericExpr::from_node(millis)?, 1.0),
        (Some(_), Some(_)) => {
            return Err(CompileError::invalid("seconds", "give either seconds or millis, not both"))
        }
        (None, None) => return Err(CompileError::MissingKey("seconds")),
    };
    Ok(Cooldown {
        key,
        window,
        millis_per_unit,
    })
}

pub(crate) fn register<T: Subject>(factories: &mut Vec<(&'static str, Factory<T>)>) {
    factories.push((
        MESSAGE,
        Factory::action(|_, value| {
            let text = TextExpr::from_node(value)?;
            Ok(Arc::new(move |ctx: &Context<T>| {
                let message = text.render(ctx);
                let targets = ctx.targets();
                if targets.is_empty() {
                    ctx.platform().send_message(ctx.subject(), &message);
                } else {
                    for target in &targets {
                        ctx.platform().send_message(target, &message);
                    }
                }
            }))
        }),
    ));

    factories.push((
        COMMAND,
        Factory::action(|_, value| {
            let text = TextExpr::from_node(value)?;
            Ok(Arc::new(move |ctx: &Context<T>| {
                let command = text.render(ctx);
                ctx.platform().run_command(ctx.subject(), &command);
            }))
        }),
    ));

    factories.push((
        SET,
        Factory::action(|_, value| {
            let key = value
                .get_present("key")
                .and_then(Node::text)
                .ok_or(CompileError::MissingKey("key"))?;
            let text = value
                .get_present("value")
                .ok_or(CompileError::MissingKey("value"))?;
            let text = TextExpr::from_node(text)?;
            Ok(Arc::new(move |ctx: &Context<T>| {
                ctx.set(key.clone(), text.render(ctx));
            }))
        }),
    ));

    factories.push((EQ, equality(false)));
    factories.push((NE, equality(true)));
    factories.push((GT, comparison(Relation::Greater)));
    factories.push((GE, comparison(Relation::GreaterOrEqual)));
    factories.push((LT, comparison(Relation::Less)));
    factories.push((LE, comparison(Relation::LessOrEqual)));

    factories.push((
        COOLDOWN,
        Factory::requirement(|_, value, _| Ok(Arc::new(compile_cooldown(value)?))),
    ));

    factories.push((
        CHANCE,
        Factory::requirement(|_, value, _| {
            let probability = NumericExpr::from_node(value)?;
            Ok(Arc::new(move |ctx: &Context<T>| ctx.roll_chance() < probability.eval(ctx)))
        }),
    ));
}
