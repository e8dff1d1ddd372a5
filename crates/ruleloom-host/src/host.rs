use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use ruleloom_config::ExpansionConfig;
use ruleloom_engine::{install_expansions, Factory, InstallReport, Registry, Subject};

use crate::scanner::ExpansionScanner;
use crate::wasm::{create_engine, WasmExpansionSource};

/// Keeps a registry in sync with an expansion directory.
///
/// Every [`reload`](ExpansionHost::reload) installs what is on disk. Keys
/// whose artifact disappeared go back to the factory that owned them before
/// the first expansion claimed them, or are unregistered if there was none.
pub struct ExpansionHost<T: Subject> {
    registry: Arc<Registry<T>>,
    source: WasmExpansionSource<T>,
    dir: PathBuf,
    scanner: Option<ExpansionScanner>,
    /// Key -> artifact currently providing it
    owned: BTreeMap<String, PathBuf>,
    /// Factories displaced by expansions, by key
    originals: HashMap<String, Factory<T>>,
}

impl<T: Subject> ExpansionHost<T> {
    pub fn new(registry: Arc<Registry<T>>, source: WasmExpansionSource<T>, dir: PathBuf) -> Self {
        Self {
            registry,
            source,
            dir,
            scanner: None,
            owned: BTreeMap::new(),
            originals: HashMap::new(),
        }
    }

    /// Watch the directory for changes, checked by [`poll`](ExpansionHost::poll)
    pub fn with_hot_reload(mut self, interval: Duration) -> Self {
        self.scanner = Some(ExpansionScanner::with_interval(self.dir.clone(), interval));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    pub fn hot_reload_interval(&self) -> Option<Duration> {
        self.scanner.as_ref().map(ExpansionScanner::interval)
    }

    /// Keys currently provided by an expansion, with their artifact
    pub fn owned(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.owned.iter().map(|(k, p)| (k.as_str(), p.as_path()))
    }

    /// Install everything in the directory and retire keys whose artifact is gone
    pub fn reload(&mut self) -> InstallReport<T> {
        let report = install_expansions(&self.registry, &self.source, &self.dir);

        let mut owned = BTreeMap::new();
        for installed in &report.installed {
            let key = &installed.type_key;
            let claimed_before = self.owned.contains_key(key) || owned.contains_key(key);
            if !claimed_before {
                if let Some(displaced) = &installed.displaced {
                    self.originals
                        .entry(key.clone())
                        .or_insert_with(|| displaced.clone());
                }
            }
            owned.insert(key.clone(), installed.path.clone());
        }

        for (key, path) in &self.owned {
            if owned.contains_key(key) {
                continue;
            }
            match self.originals.remove(key) {
                Some(original) => {
                    self.registry.replace(key, original);
                    info!(
                        target: "expansions",
                        "Expansion '{}' from {} is gone, restored the previous rule type",
                        key,
                        path.display()
                    );
                }
                None => {
                    self.registry.unregister(key);
                    info!(
                        target: "expansions",
                        "Expansion '{}' from {} is gone, unregistered",
                        key,
                        path.display()
                    );
                }
            }
        }

        self.owned = owned;
        report
    }

    /// Reload if hot reload is on, the scan interval elapsed and something changed
    pub fn poll(&mut self) -> Option<InstallReport<T>> {
        let scanner = self.scanner.as_mut()?;
        if !scanner.should_scan() || !scanner.scan().has_changes() {
            return None;
        }

        info!(
            target: "expansions",
            "Expansion artifacts changed in {}, reloading",
            self.dir.display()
        );
        Some(self.reload())
    }
}

/// Create an expansion host from config and install what is on disk
pub fn create_host_from_config<T: Subject>(
    registry: Arc<Registry<T>>,
    config: &ExpansionConfig,
) -> Result<ExpansionHost<T>> {
    let engine = create_engine()?;
    let source = WasmExpansionSource::new(engine, config.fuel_per_call)?;
    let mut host = ExpansionHost::new(registry, source, config.dir());

    if !config.enabled {
        debug!(target: "expansions", "Expansions are disabled");
        return Ok(host);
    }

    if config.hot_reload {
        host = host.with_hot_reload(Duration::from_millis(config.hot_reload_interval_ms));
    }
    debug!(target: "expansions", "Loading expansions from: {}", host.dir().display());
    host.reload();

    Ok(host)
}
