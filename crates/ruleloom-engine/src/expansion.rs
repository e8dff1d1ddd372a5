//! Expansion install contract
//!
//! An [`ExpansionSource`] turns a directory into resolved descriptors (or
//! per-artifact errors); [`install_expansions`] puts the resolved ones into
//! a registry, replacing whatever owned their keys before.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::describe_panic;
use crate::error::ExpansionError;
use crate::platform::Subject;
use crate::registry::{Factory, Registry};

/// A resolved expansion ready to be installed
pub struct ExpansionDescriptor<T: Subject> {
    pub type_key: String,
    pub version: String,
    pub author: String,
    pub factory: Factory<T>,
}

impl<T: Subject> fmt::Debug for ExpansionDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpansionDescriptor")
            .field("type_key", &self.type_key)
            .field("version", &self.version)
            .field("author", &self.author)
            .field("factory", &self.factory)
            .finish()
    }
}

/// Outcome of loading one artifact
#[derive(Debug)]
pub struct DiscoveredArtifact<T: Subject> {
    pub path: PathBuf,
    pub result: Result<ExpansionDescriptor<T>, ExpansionError>,
}

/// Finds and resolves expansion artifacts
pub trait ExpansionSource<T: Subject>: Send + Sync {
    /// Resolve every artifact in `dir`. A missing directory yields nothing.
    fn discover(&self, dir: &Path) -> Vec<DiscoveredArtifact<T>>;
}

/// One installed expansion
#[derive(Debug)]
pub struct InstalledExpansion<T: Subject> {
    pub path: PathBuf,
    pub type_key: String,
    pub version: String,
    pub author: String,
    /// The factory that owned the key before the install
    pub displaced: Option<Factory<T>>,
}

/// What an install pass did
#[derive(Debug)]
pub struct InstallReport<T: Subject> {
    pub installed: Vec<InstalledExpansion<T>>,
    pub failed: Vec<(PathBuf, String)>,
}

impl<T: Subject> InstallReport<T> {
    fn empty() -> Self {
        Self {
            installed: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn installed_keys(&self) -> Vec<&str> {
        self.installed.iter().map(|e| e.type_key.as_str()).collect()
    }
}

/// Install every artifact `source` resolves from `dir`.
///
/// Failed artifacts are logged and skipped. Each resolved artifact replaces
/// the current owner of its key in one step.
pub fn install_expansions<T: Subject>(
    registry: &Registry<T>,
    source: &dyn ExpansionSource<T>,
    dir: &Path,
) -> InstallReport<T> {
    let mut report = InstallReport::empty();

    let artifacts = match std::panic::catch_unwind(AssertUnwindSafe(|| source.discover(dir))) {
        Ok(artifacts) => artifacts,
        Err(panic) => {
            warn!(
                target: "expansions",
                "Expansion discovery in {} panicked: {}",
                dir.display(),
                describe_panic(panic.as_ref())
            );
            return report;
        }
    };

    for artifact in artifacts {
        match artifact.result {
            Ok(descriptor) => {
                let displaced = registry.replace(&descriptor.type_key, descriptor.factory);
                info!(
                    target: "expansions",
                    "Installed expansion '{}' v{} by {}{}",
                    descriptor.type_key,
                    descriptor.version,
                    descriptor.author,
                    if displaced.is_some() { " (override)" } else { "" }
                );
                report.installed.push(InstalledExpansion {
                    path: artifact.path,
                    type_key: descriptor.type_key,
                    version: descriptor.version,
                    author: descriptor.author,
                    displaced,
                });
            }
            Err(e) => {
                warn!(
                    target: "expansions",
                    "Failed to load expansion {}: {}",
                    artifact.path.display(),
                    e
                );
                report.failed.push((artifact.path, e.to_string()));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::context::Context;
    use crate::node::Node;
    use crate::rule::ActionBody;
    use std::sync::Arc;

    struct FixedSource;

    impl ExpansionSource<String> for FixedSource {
        fn discover(&self, dir: &Path) -> Vec<DiscoveredArtifact<String>> {
            vec![
                DiscoveredArtifact {
                    path: dir.join("good.wasm"),
                    result: Ok(ExpansionDescriptor {
                        type_key: "command".to_string(),
                        version: "1.2.0".to_string(),
                        author: "someone".to_string(),
                        factory: Factory::action(|_: &Compiler<String>, _: &Node| {
                            Ok(Arc::new(|_: &Context<String>| {}) as Arc<dyn ActionBody<String>>)
                        }),
                    }),
                },
                DiscoveredArtifact {
                    path: dir.join("bad.wasm"),
                    result: Err(ExpansionError::MissingExport("run".to_string())),
                },
            ]
        }
    }

    struct PanickingSource;

    impl ExpansionSource<String> for PanickingSource {
        fn discover(&self, _dir: &Path) -> Vec<DiscoveredArtifact<String>> {
            panic!("disk on fire")
        }
    }

    #[test]
    fn test_install_overrides_and_skips_failures() {
        let registry = Registry::<String>::new();
        crate::builtins::register_builtins(&registry);
        let before = registry.len();

        let report = install_expansions(&registry, &FixedSource, Path::new("/tmp/x"));
        assert_eq!(report.installed_keys(), vec!["command"]);
        assert!(report.installed[0].displaced.is_some());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_install_is_repeatable() {
        let registry = Registry::<String>::new();
        install_expansions(&registry, &FixedSource, Path::new("/tmp/x"));
        let again = install_expansions(&registry, &FixedSource, Path::new("/tmp/x"));
        assert_eq!(again.installed.len(), 1);
        assert_eq!(registry.keys(), vec!["command"]);
    }

    #[test]
    fn test_panicking_source_installs_nothing() {
        let registry = Registry::<String>::new();
        let report = install_expansions(&registry, &PanickingSource, Path::new("/tmp/x"));
        assert!(report.installed.is_empty());
        assert!(registry.is_empty());
    }
}
