//! Rule types every engine starts with

pub mod basic;
pub mod control;

use crate::platform::Subject;
use crate::registry::{Factory, Registry};

/// Every built-in factory with its type key
pub fn builtin_factories<T: Subject>() -> Vec<(&'static str, Factory<T>)> {
    let mut factories = Vec::new();
    control::register(&mut factories);
    basic::register(&mut factories);
    factories
}

/// Register the built-ins, skipping keys that are already taken
pub fn register_builtins<T: Subject>(registry: &Registry<T>) -> usize {
    builtin_factories()
        .into_iter()
        .filter(|(key, factory)| registry.register(factory.clone(), &[*key]))
        .count()
}
