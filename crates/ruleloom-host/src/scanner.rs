//! Artifact change detection for hot reloading
//!
//! [`ExpansionScanner`] remembers the modification time of every artifact in
//! the expansion directory and reports what changed since the last scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use crate::wasm::is_artifact;

/// Default scan interval (1 Hz)
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Differences between two scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactChanges {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ArtifactChanges {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }
}

pub struct ExpansionScanner {
    dir: PathBuf,
    interval: Duration,
    last_scan: Option<Instant>,
    known: BTreeMap<PathBuf, SystemTime>,
}

impl ExpansionScanner {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_interval(dir, DEFAULT_SCAN_INTERVAL)
    }

    /// Artifacts already present are treated as known, not added
    pub fn with_interval(dir: PathBuf, interval: Duration) -> Self {
        let known = snapshot(&dir);
        Self {
            dir,
            interval,
            last_scan: None,
            known,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of artifacts seen by the last scan
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn should_scan(&self) -> bool {
        self.last_scan.map_or(true, |last| last.elapsed() >= self.interval)
    }

    /// Rescan the directory and return what changed
    pub fn scan(&mut self) -> ArtifactChanges {
        self.last_scan = Some(Instant::now());

        let current = snapshot(&self.dir);
        let mut changes = ArtifactChanges::default();

        for (path, modified) in &current {
            match self.known.get(path) {
                None => changes.added.push(path.clone()),
                Some(previous) if previous != modified => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        changes.removed = self
            .known
            .keys()
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();

        if changes.has_changes() {
            debug!(
                target: "expansions",
                "{}: {} added, {} modified, {} removed",
                self.dir.display(),
                changes.added.len(),
                changes.modified.len(),
                changes.removed.len()
            );
        }

        self.known = current;
        changes
    }
}

/// Modification times of every artifact in `dir`; a missing directory is empty
fn snapshot(dir: &Path) -> BTreeMap<PathBuf, SystemTime> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BTreeMap::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !is_artifact(&path) {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some((path, metadata.modified().ok()?))
        })
        .collect()
}
