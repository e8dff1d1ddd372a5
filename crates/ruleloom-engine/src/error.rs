//! Error types for ruleloom-engine
//!
//! None of these ever escape a trigger. The compiler turns them into a
//! logged warning plus a no-op rule; the expansion installer turns them
//! into a per-artifact warning.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to read a configuration tree
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure to compile a numeric or text template
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated {what} starting at offset {offset}")]
    Unterminated { what: &'static str, offset: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("empty expression")]
    Empty,

    #[error("expected a scalar, found a {0}")]
    Shape(&'static str),
}

/// Failure to compile one rule node
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("expected {expected}, found {found}")]
    Shape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    #[error("rejected: {0}")]
    Rejected(String),

    /// A nested rule failed and has already reported why
    #[error("a nested rule failed to compile")]
    NestedRejected,
}

impl CompileError {
    pub fn shape(expected: &'static str, found: &crate::Node) -> Self {
        CompileError::Shape {
            expected,
            found: found.shape(),
        }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failure to resolve one expansion artifact
#[derive(Error, Debug)]
pub enum ExpansionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing export '{0}'")]
    MissingExport(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("incompatible artifact: {0}")]
    Incompatible(String),

    #[error("failed to instantiate: {0}")]
    Instantiate(String),
}

/// Failure to load a rule book
#[derive(Error, Debug)]
pub enum RuleBookError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}
