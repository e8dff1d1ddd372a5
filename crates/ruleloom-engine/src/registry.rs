//! Type registry
//!
//! Maps rule type keys to the factories that compile them. One registry
//! exists per subject domain; expansions replace entries in place.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::compiler::Compiler;
use crate::error::CompileError;
use crate::node::Node;
use crate::platform::Subject;
use crate::rule::{ActionBody, RequirementBody};

/// Compiles the `value` of an action node
pub trait ActionFactory<T: Subject>: Send + Sync {
    fn compile(&self, compiler: &Compiler<T>, value: &Node)
        -> Result<Arc<dyn ActionBody<T>>, CompileError>;
}

impl<T, F> ActionFactory<T> for F
where
    T: Subject,
    F: Fn(&Compiler<T>, &Node) -> Result<Arc<dyn ActionBody<T>>, CompileError> + Send + Sync,
{
    fn compile(
        &self,
        compiler: &Compiler<T>,
        value: &Node,
    ) -> Result<Arc<dyn ActionBody<T>>, CompileError> {
        self(compiler, value)
    }
}

/// Compiles the `value` of a requirement node.
///
/// `run_side_effects` is the flag the requirement itself is compiled with;
/// combinators pass it on to their children.
pub trait RequirementFactory<T: Subject>: Send + Sync {
    fn compile(
        &self,
        compiler: &Compiler<T>,
        value: &Node,
        run_side_effects: bool,
    ) -> Result<Arc<dyn RequirementBody<T>>, CompileError>;
}

impl<T, F> RequirementFactory<T> for F
where
    T: Subject,
    F: Fn(&Compiler<T>, &Node, bool) -> Result<Arc<dyn RequirementBody<T>>, CompileError>
        + Send
        + Sync,
{
    fn compile(
        &self,
        compiler: &Compiler<T>,
        value: &Node,
        run_side_effects: bool,
    ) -> Result<Arc<dyn RequirementBody<T>>, CompileError> {
        self(compiler, value, run_side_effects)
    }
}

/// A registered rule type
pub enum Factory<T: Subject> {
    Action(Arc<dyn ActionFactory<T>>),
    Requirement(Arc<dyn RequirementFactory<T>>),
}

impl<T: Subject> Clone for Factory<T> {
    fn clone(&self) -> Self {
        match self {
            Factory::Action(f) => Factory::Action(f.clone()),
            Factory::Requirement(f) => Factory::Requirement(f.clone()),
        }
    }
}

impl<T: Subject> Factory<T> {
    pub fn action<F>(factory: F) -> Self
    where
        F: Fn(&Compiler<T>, &Node) -> Result<Arc<dyn ActionBody<T>>, CompileError>
            + Send
            + Sync
            + 'static,
    {
        Factory::Action(Arc::new(factory))
    }

    pub fn requirement<F>(factory: F) -> Self
    where
        F: Fn(&Compiler<T>, &Node, bool) -> Result<Arc<dyn RequirementBody<T>>, CompileError>
            + Send
            + Sync
            + 'static,
    {
        Factory::Requirement(Arc::new(factory))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Factory::Action(_) => "action",
            Factory::Requirement(_) => "requirement",
        }
    }

    /// Whether two handles point at the same factory
    pub fn same_as(&self, other: &Factory<T>) -> bool {
        match (self, other) {
            (Factory::Action(a), Factory::Action(b)) => Arc::ptr_eq(a, b),
            (Factory::Requirement(a), Factory::Requirement(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T: Subject> fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factory::{}", self.kind())
    }
}

/// Type key to factory mapping, safe to share across threads
pub struct Registry<T: Subject> {
    factories: RwLock<HashMap<String, Factory<T>>>,
}

impl<T: Subject> Registry<T> {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register `factory` under every key in `keys`.
    ///
    /// Fails without changing anything if any key is already taken (or
    /// repeated within `keys`).
    pub fn register(&self, factory: Factory<T>, keys: &[&str]) -> bool {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);

        let mut seen = Vec::with_capacity(keys.len());
        for key in keys {
            if factories.contains_key(*key) || seen.contains(key) {
                debug!(target: "rules", "Type key '{}' is already registered", key);
                return false;
            }
            seen.push(key);
        }

        for key in keys {
            factories.insert(key.to_string(), factory.clone());
        }
        debug!(target: "rules", "Registered {} {:?}", factory.kind(), keys);
        true
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn lookup(&self, key: &str) -> Option<Factory<T>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Install `factory` under `key`, returning the factory it displaced.
    /// Readers never observe the key as absent.
    pub fn replace(&self, key: &str, factory: Factory<T>) -> Option<Factory<T>> {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), factory)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.factories.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Subject> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
