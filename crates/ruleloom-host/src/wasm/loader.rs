use anyhow::Result;
use std::path::Path;
use tracing::{debug, info, warn};
use wasmtime::{Engine, Linker};

use ruleloom_engine::{DiscoveredArtifact, ExpansionSource, Subject};

use super::bindings::{add_host_imports, HostState};
use super::WasmExpansion;

/// Whether a path names an expansion artifact (`.wasm` or `.wat`)
pub fn is_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("wasm") | Some("wat")
    )
}

/// Resolves expansion artifacts from a directory into registry factories
pub struct WasmExpansionSource<T: Subject> {
    engine: Engine,
    linker: Linker<HostState<T>>,
    fuel_per_call: u64,
}

impl<T: Subject> WasmExpansionSource<T> {
    pub fn new(engine: Engine, fuel_per_call: u64) -> Result<Self> {
        let mut linker = Linker::new(&engine);
        add_host_imports(&mut linker)?;

        Ok(Self {
            engine,
            linker,
            fuel_per_call,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn fuel_per_call(&self) -> u64 {
        self.fuel_per_call
    }

    /// Load a single artifact
    pub fn load(&self, path: &Path) -> DiscoveredArtifact<T> {
        let result = WasmExpansion::from_file(&self.engine, &self.linker, path, self.fuel_per_call)
            .map(WasmExpansion::into_descriptor);

        DiscoveredArtifact {
            path: path.to_path_buf(),
            result,
        }
    }
}

impl<T: Subject> ExpansionSource<T> for WasmExpansionSource<T> {
    fn discover(&self, dir: &Path) -> Vec<DiscoveredArtifact<T>> {
        if !dir.exists() {
            info!(
                target: "expansions",
                "Expansion directory does not exist: {} (fine if no expansions are used)",
                dir.display()
            );
            return Vec::new();
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    target: "expansions",
                    "Failed to read expansion directory {}: {}",
                    dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_artifact(path))
            .collect();
        // Later files win when two artifacts claim the same key
        paths.sort();

        debug!(
            target: "expansions",
            "Found {} artifact(s) in {}",
            paths.len(),
            dir.display()
        );

        paths.iter().map(|path| self.load(path)).collect()
    }
}
