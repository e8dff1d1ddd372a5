//! Configuration tree consumed by the rule compiler
//!
//! Rule files are authored as YAML (or TOML) and converted into a small
//! tagged tree so factories can pattern-match on shape instead of poking at
//! loosely typed values. Map entries keep their declared order because
//! action blocks run in that order.

use std::path::Path;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::NodeError;

static NULL: Node = Node::Scalar(Scalar::Null);

/// A leaf value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// One node of a configuration tree
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Node {
    Scalar(Scalar),
    List(Vec<Node>),
    Map(IndexMap<String, Node>),
}

impl Node {
    /// Shared null node, used as the value of absent keys
    pub fn null() -> &'static Node {
        &NULL
    }

    /// Parse YAML text into a tree
    pub fn from_yaml_str(text: &str) -> Result<Node, NodeError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        Ok(Node::from(value))
    }

    /// Parse TOML text into a tree
    pub fn from_toml_str(text: &str) -> Result<Node, NodeError> {
        let value: toml::Value = toml::from_str(text)?;
        Ok(Node::from(value))
    }

    /// Read a rule file, choosing the format from the extension (`.toml`
    /// is TOML, anything else is YAML)
    pub fn load(path: &Path) -> Result<Node, NodeError> {
        let text = std::fs::read_to_string(path).map_err(|source| NodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Node::from_toml_str(&text),
            _ => Node::from_yaml_str(&text),
        }
    }

    /// Name of this node's shape, for diagnostics
    pub fn shape(&self) -> &'static str {
        match self {
            Node::Scalar(_) => "scalar",
            Node::List(_) => "list",
            Node::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Scalar(Scalar::Null))
    }

    /// Look up a key of a map node
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up a key of a map node, treating an explicit null as absent
    pub fn get_present(&self, key: &str) -> Option<&Node> {
        self.get(key).filter(|node| !node.is_null())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Node::Scalar(Scalar::Int(i)) => Some(*i as f64),
            Node::Scalar(Scalar::Float(f)) => Some(*f),
            Node::Scalar(Scalar::Str(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Scalar(Scalar::Int(i)) => Some(*i),
            Node::Scalar(Scalar::Float(f)) if f.fract() == 0.0 => Some(*f as i64),
            Node::Scalar(Scalar::Str(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Scalar(Scalar::Bool(b)) => Some(*b),
            Node::Scalar(Scalar::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => Some(true),
                "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Render a scalar as text; `None` for null and structured nodes
    pub fn text(&self) -> Option<String> {
        match self {
            Node::Scalar(Scalar::Null) => None,
            Node::Scalar(Scalar::Bool(b)) => Some(b.to_string()),
            Node::Scalar(Scalar::Int(i)) => Some(i.to_string()),
            Node::Scalar(Scalar::Float(f)) => Some(f.to_string()),
            Node::Scalar(Scalar::Str(s)) => Some(s.clone()),
            Node::List(_) | Node::Map(_) => None,
        }
    }

    /// Ordered children: map entries by name, list items by index
    pub fn children(&self) -> Vec<(String, &Node)> {
        match self {
            Node::Map(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Node::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            Node::Scalar(_) => Vec::new(),
        }
    }

    /// Serialize as JSON, the format handed to expansion artifacts
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::Scalar(Scalar::Null)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Scalar(Scalar::Str(value.to_string()))
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Scalar(Scalar::Str(value))
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Scalar(Scalar::Int(value))
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Scalar(Scalar::Float(value))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Scalar(Scalar::Bool(value))
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::List(value)
    }
}

impl From<IndexMap<String, Node>> for Node {
    fn from(value: IndexMap<String, Node>) -> Self {
        Node::Map(value)
    }
}

impl From<serde_yaml::Value> for Node {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;

        match value {
            Value::Null => Node::Scalar(Scalar::Null),
            Value::Bool(b) => Node::Scalar(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Scalar(Scalar::Int(i)),
                None => Node::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Node::Scalar(Scalar::Str(s)),
            Value::Sequence(items) => Node::List(items.into_iter().map(Node::from).collect()),
            Value::Mapping(map) => Node::Map(
                map.into_iter()
                    .map(|(k, v)| (yaml_key(k), Node::from(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => Node::from(tagged.value),
        }
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    use serde_yaml::Value;

    match key {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl From<toml::Value> for Node {
    fn from(value: toml::Value) -> Self {
        use toml::Value;

        match value {
            Value::String(s) => Node::Scalar(Scalar::Str(s)),
            Value::Integer(i) => Node::Scalar(Scalar::Int(i)),
            Value::Float(f) => Node::Scalar(Scalar::Float(f)),
            Value::Boolean(b) => Node::Scalar(Scalar::Bool(b)),
            Value::Datetime(d) => Node::Scalar(Scalar::Str(d.to_string())),
            Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            Value::Table(table) => Node::Map(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Node::from(v)))
                    .collect(),
            ),
        }
    }
}
