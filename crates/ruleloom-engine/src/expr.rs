//! Numeric and text templates
//!
//! Templates are compiled once when a rule is built and evaluated on every
//! trigger. Two kinds of references are understood:
//!
//! - `{key}` reads a property of the trigger context
//! - `%name%` asks the platform's placeholder resolver for the subject
//!
//! Numeric templates additionally support `+ - * / % ^`, parentheses and
//! `min`, `max`, `abs`, `floor`, `ceil`, `round`, `sqrt`. A reference that
//! cannot be read as a number evaluates to NaN, which fails every
//! comparison and every chance roll.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::error::ExprError;
use crate::node::{Node, Scalar};
use crate::platform::Subject;

fn is_reference_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | ':' | '-')
}

/// Length in bytes of a `%name%` placeholder starting at `start`, if any
fn placeholder_at(src: &str, start: usize) -> Option<(String, usize)> {
    let rest = &src[start + 1..];
    let end = rest.find('%')?;
    let name = &rest[..end];
    if name.is_empty() || !name.chars().all(is_reference_char) {
        return None;
    }
    Some((name.to_string(), end + 2))
}

/// Length in bytes of a `{key}` reference starting at `start`
fn property_at(src: &str, start: usize) -> Result<(String, usize), ExprError> {
    let rest = &src[start + 1..];
    let end = rest.find('}').ok_or(ExprError::Unterminated {
        what: "property reference",
        offset: start,
    })?;
    let key = rest[..end].trim();
    if key.is_empty() {
        return Err(ExprError::Empty);
    }
    if let Some(ch) = key.chars().find(|ch| !is_reference_char(*ch)) {
        return Err(ExprError::UnexpectedChar {
            ch,
            offset: start + 1,
        });
    }
    Ok((key.to_string(), end + 2))
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Property(String),
    Placeholder(String),
}

/// A compiled text template
#[derive(Clone)]
pub struct TextExpr {
    source: Arc<str>,
    segments: Arc<[Segment]>,
}

impl TextExpr {
    pub fn compile(template: &str) -> Result<Self, ExprError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut offset = 0;

        while let Some(ch) = template[offset..].chars().next() {
            match ch {
                '%' if template[offset + 1..].starts_with('%') => {
                    literal.push('%');
                    offset += 2;
                }
                '%' => match placeholder_at(template, offset) {
                    Some((name, len)) => {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        segments.push(Segment::Placeholder(name));
                        offset += len;
                    }
                    None => {
                        literal.push('%');
                        offset += 1;
                    }
                },
                '{' => {
                    let (key, len) = property_at(template, offset)?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Property(key));
                    offset += len;
                }
                other => {
                    literal.push(other);
                    offset += other.len_utf8();
                }
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.into(),
            segments: segments.into(),
        })
    }

    /// A template with no references
    pub fn literal(text: &str) -> Self {
        Self {
            source: text.into(),
            segments: vec![Segment::Literal(text.to_string())].into(),
        }
    }

    /// Compile a scalar node; numbers and booleans become literal text
    pub fn from_node(node: &Node) -> Result<Self, ExprError> {
        match node {
            Node::Scalar(Scalar::Null) => Err(ExprError::Empty),
            Node::Scalar(Scalar::Str(s)) => Self::compile(s),
            Node::Scalar(_) => Ok(Self::literal(&node.text().unwrap_or_default())),
            other => Err(ExprError::Shape(other.shape())),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether rendering never depends on the context
    pub fn is_constant(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Render against a context. Unknown references are left verbatim.
    pub fn render<T: Subject>(&self, ctx: &Context<T>) -> String {
        let mut out = String::with_capacity(self.source.len());

        for segment in self.segments.iter() {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Property(key) => match ctx.get_text(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                },
                Segment::Placeholder(name) => match ctx.resolve_placeholder(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                },
            }
        }

        out
    }
}

impl fmt::Debug for TextExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TextExpr").field(&self.source).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    f64::NAN
                } else {
                    a / b
                }
            }
            BinOp::Rem => a % b,
            BinOp::Pow => a.powf(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Min,
    Max,
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "abs" => Some(Func::Abs),
            "floor" => Some(Func::Floor),
            "ceil" => Some(Func::Ceil),
            "round" => Some(Func::Round),
            "sqrt" => Some(Func::Sqrt),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Func::Min => args[0].min(args[1]),
            Func::Max => args[0].max(args[1]),
            Func::Abs => args[0].abs(),
            Func::Floor => args[0].floor(),
            Func::Ceil => args[0].ceil(),
            Func::Round => args[0].round(),
            Func::Sqrt => args[0].sqrt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Num {
    Const(f64),
    Property(String),
    Placeholder(String),
    Neg(Box<Num>),
    Binary(BinOp, Box<Num>, Box<Num>),
    Call(Func, Vec<Num>),
}

impl Num {
    fn as_const(&self) -> Option<f64> {
        match self {
            Num::Const(v) => Some(*v),
            _ => None,
        }
    }

    /// Collapse sub-trees that do not depend on the context
    fn fold(self) -> Num {
        match self {
            Num::Neg(inner) => match inner.fold() {
                Num::Const(v) => Num::Const(-v),
                other => Num::Neg(Box::new(other)),
            },
            Num::Binary(op, a, b) => {
                let (a, b) = (a.fold(), b.fold());
                match (a.as_const(), b.as_const()) {
                    (Some(x), Some(y)) => Num::Const(op.apply(x, y)),
                    _ => Num::Binary(op, Box::new(a), Box::new(b)),
                }
            }
            Num::Call(func, args) => {
                let args: Vec<Num> = args.into_iter().map(Num::fold).collect();
                let consts: Option<Vec<f64>> = args.iter().map(Num::as_const).collect();
                match consts {
                    Some(values) => Num::Const(func.apply(&values)),
                    None => Num::Call(func, args),
                }
            }
            leaf => leaf,
        }
    }

    fn eval<T: Subject>(&self, ctx: &Context<T>) -> f64 {
        match self {
            Num::Const(v) => *v,
            Num::Property(key) => ctx.get_f64(key).unwrap_or_else(|| {
                trace!(target: "rules", "Property '{}' is not numeric", key);
                f64::NAN
            }),
            Num::Placeholder(name) => ctx
                .resolve_placeholder(name)
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or_else(|| {
                    trace!(target: "rules", "Placeholder '%{}%' is not numeric", name);
                    f64::NAN
                }),
            Num::Neg(inner) => -inner.eval(ctx),
            Num::Binary(op, a, b) => op.apply(a.eval(ctx), b.eval(ctx)),
            Num::Call(func, args) => {
                let values: Vec<f64> = args.iter().map(|arg| arg.eval(ctx)).collect();
                func.apply(&values)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Property(String),
    Placeholder(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "{}", v),
            Token::Ident(name) => write!(f, "{}", name),
            Token::Property(key) => write!(f, "{{{}}}", key),
            Token::Placeholder(name) => write!(f, "%{}%", name),
            Token::Op(op) => write!(f, "{}", op),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut offset = 0;

    while let Some(ch) = src[offset..].chars().next() {
        match ch {
            c if c.is_whitespace() => offset += c.len_utf8(),
            c if c.is_ascii_digit() || c == '.' => {
                let len = src[offset..]
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .unwrap_or(src.len() - offset);
                let text = &src[offset..offset + len];
                let value = text
                    .parse()
                    .map_err(|_| ExprError::UnexpectedToken(text.to_string()))?;
                tokens.push(Token::Number(value));
                offset += len;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = src[offset..]
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(src.len() - offset);
                tokens.push(Token::Ident(src[offset..offset + len].to_string()));
                offset += len;
            }
            '{' => {
                let (key, len) = property_at(src, offset)?;
                tokens.push(Token::Property(key));
                offset += len;
            }
            '%' => match placeholder_at(src, offset) {
                Some((name, len)) => {
                    tokens.push(Token::Placeholder(name));
                    offset += len;
                }
                None => {
                    tokens.push(Token::Op('%'));
                    offset += 1;
                }
            },
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(ch));
                offset += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                offset += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                offset += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                offset += 1;
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken(token.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expression(&mut self) -> Result<Num, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Num::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Num, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            let op = match op {
                '*' => BinOp::Mul,
                '/' => BinOp::Div,
                _ => BinOp::Rem,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Num::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Num, ExprError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Num::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Num, ExprError> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Num::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Num, ExprError> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Num::Const(v)),
            Some(Token::Property(key)) => Ok(Num::Property(key)),
            Some(Token::Placeholder(name)) => Ok(Num::Placeholder(name)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let func =
                    Func::lookup(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.expression()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.expression()?);
                    }
                }
                self.expect(Token::RParen)?;
                if args.len() != func.arity() {
                    return Err(ExprError::Arity {
                        name,
                        expected: func.arity(),
                        got: args.len(),
                    });
                }
                Ok(Num::Call(func, args))
            }
            Some(token) => Err(ExprError::UnexpectedToken(token.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// A compiled numeric template
#[derive(Clone)]
pub struct NumericExpr {
    source: Arc<str>,
    root: Arc<Num>,
}

impl NumericExpr {
    pub fn compile(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(ExprError::UnexpectedToken(token.to_string()));
        }

        Ok(Self {
            source: src.into(),
            root: Arc::new(root.fold()),
        })
    }

    pub fn constant(value: f64) -> Self {
        Self {
            source: value.to_string().into(),
            root: Arc::new(Num::Const(value)),
        }
    }

    /// Compile a scalar node; numbers are constants, strings are parsed
    pub fn from_node(node: &Node) -> Result<Self, ExprError> {
        match node {
            Node::Scalar(Scalar::Int(i)) => Ok(Self::constant(*i as f64)),
            Node::Scalar(Scalar::Float(f)) => Ok(Self::constant(*f)),
            Node::Scalar(Scalar::Str(s)) => Self::compile(s),
            Node::Scalar(Scalar::Null) => Err(ExprError::Empty),
            Node::Scalar(Scalar::Bool(_)) => Err(ExprError::UnexpectedToken(
                node.text().unwrap_or_default(),
            )),
            other => Err(ExprError::Shape(other.shape())),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The value of a template that does not depend on the context
    pub fn constant_value(&self) -> Option<f64> {
        self.root.as_const()
    }

    pub fn eval<T: Subject>(&self, ctx: &Context<T>) -> f64 {
        self.root.eval(ctx)
    }
}

impl fmt::Debug for NumericExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NumericExpr").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::cooldown::CooldownLedger;
    use crate::platform::Platform;
    use crate::scheduler::TickScheduler;

    struct Placeholders;

    impl Platform<String> for Placeholders {
        fn resolve_placeholder(&self, subject: &String, name: &str) -> Option<String> {
            match name {
                "player_name" => Some(subject.clone()),
                "player_level" => Some("30".to_string()),
                "island_rank" => Some("first".to_string()),
                _ => None,
            }
        }

        fn send_message(&self, _target: &String, _message: &str) {}

        fn run_command(&self, _subject: &String, _command: &str) {}
    }

    fn context() -> Context<String> {
        let services = Services::new(
            Arc::new(Placeholders),
            Arc::new(TickScheduler::new()),
            Arc::new(CooldownLedger::new()),
        );
        Context::new(Arc::new("alice".to_string()), Arc::new(services))
    }

    #[test]
    fn test_text_literal_and_references() {
        let ctx = context().with_property("reward", "diamond");
        let expr = TextExpr::compile("Hi %player_name%, take a {reward}!").unwrap();
        assert!(!expr.is_constant());
        assert_eq!(expr.render(&ctx), "Hi alice, take a diamond!");
    }

    #[test]
    fn test_text_unknown_references_render_verbatim() {
        let ctx = context();
        let expr = TextExpr::compile("%nope% {missing}").unwrap();
        assert_eq!(expr.render(&ctx), "%nope% {missing}");
    }

    #[test]
    fn test_text_percent_signs() {
        let ctx = context();
        let expr = TextExpr::compile("50% off, 100%% sure").unwrap();
        assert!(expr.is_constant());
        assert_eq!(expr.render(&ctx), "50% off, 100% sure");
    }

    #[test]
    fn test_text_unterminated_property() {
        assert!(matches!(
            TextExpr::compile("hello {name"),
            Err(ExprError::Unterminated { .. })
        ));
    }

    #[test]
    fn test_text_from_node() {
        let ctx = context();
        assert_eq!(TextExpr::from_node(&Node::from(5_i64)).unwrap().render(&ctx), "5");
        assert!(matches!(
            TextExpr::from_node(&Node::List(vec![])),
            Err(ExprError::Shape("list"))
        ));
    }

    #[test]
    fn test_numeric_precedence() {
        let ctx = context();
        let eval = |src: &str| NumericExpr::compile(src).unwrap().eval(&ctx);
        assert_eq!(eval("1 + 2 * 3"), 7.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("-2 ^ 2"), -4.0);
        assert_eq!(eval("2 ^ 3 ^ 2"), 512.0);
        assert_eq!(eval("10 % 4"), 2.0);
        assert_eq!(eval("max(3, min(10, 7)) + abs(-1)"), 8.0);
        assert_eq!(eval("floor(2.7) + ceil(0.2) + round(1.5) + sqrt(16)"), 9.0);
    }

    #[test]
    fn test_numeric_constants_are_folded() {
        let expr = NumericExpr::compile("0.25 * 2").unwrap();
        assert_eq!(expr.constant_value(), Some(0.5));

        let expr = NumericExpr::compile("{luck} * 2").unwrap();
        assert_eq!(expr.constant_value(), None);
    }

    #[test]
    fn test_numeric_references() {
        let ctx = context().with_property("bonus", 5_i64);
        let expr = NumericExpr::compile("%player_level% / 3 + {bonus}").unwrap();
        assert_eq!(expr.eval(&ctx), 15.0);
    }

    #[test]
    fn test_numeric_unresolved_is_nan() {
        let ctx = context();
        assert!(NumericExpr::compile("{missing} + 1").unwrap().eval(&ctx).is_nan());
        assert!(NumericExpr::compile("%island_rank%").unwrap().eval(&ctx).is_nan());
        assert!(NumericExpr::compile("1 / 0").unwrap().eval(&ctx).is_nan());
    }

    #[test]
    fn test_numeric_errors() {
        assert!(matches!(NumericExpr::compile("  "), Err(ExprError::Empty)));
        assert!(matches!(NumericExpr::compile("1 +"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(NumericExpr::compile("1 2"), Err(ExprError::UnexpectedToken(_))));
        assert!(matches!(NumericExpr::compile("pow(1)"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(NumericExpr::compile("min(1)"), Err(ExprError::Arity { .. })));
        assert!(matches!(
            NumericExpr::compile("1 $ 2"),
            Err(ExprError::UnexpectedChar { ch: '$', .. })
        ));
        assert!(matches!(NumericExpr::compile("(1 + 2"), Err(ExprError::UnexpectedEnd)));
    }

    #[test]
    fn test_numeric_from_node() {
        assert_eq!(NumericExpr::from_node(&Node::from(0.5)).unwrap().constant_value(), Some(0.5));
        assert_eq!(NumericExpr::from_node(&Node::from(3_i64)).unwrap().constant_value(), Some(3.0));
        assert!(NumericExpr::from_node(&Node::from(true)).is_err());
        assert!(matches!(
            NumericExpr::from_node(&Node::List(vec![])),
            Err(ExprError::Shape("list"))
        ));
    }
}
