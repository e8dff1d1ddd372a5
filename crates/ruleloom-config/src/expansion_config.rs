use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::paths::data_dir_or_local;

/// Default fuel budget for one call into an expansion
pub const DEFAULT_FUEL_PER_CALL: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionConfig {
    /// Whether expansions are loaded at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory scanned for artifacts (default: <data dir>/expansions)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Reinstall expansions when artifacts change on disk
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Hot reload scan interval in milliseconds
    #[serde(default = "default_hot_reload_interval")]
    pub hot_reload_interval_ms: u64,

    /// Fuel granted to each call into an expansion
    #[serde(default = "default_fuel_per_call")]
    pub fuel_per_call: u64,
}

fn default_true() -> bool {
    true
}

fn default_hot_reload_interval() -> u64 {
    1000
}

fn default_fuel_per_call() -> u64 {
    DEFAULT_FUEL_PER_CALL
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            hot_reload: true,
            hot_reload_interval_ms: default_hot_reload_interval(),
            fuel_per_call: DEFAULT_FUEL_PER_CALL,
        }
    }
}

impl ExpansionConfig {
    /// The configured directory, or the default one
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| data_dir_or_local().join("expansions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: ExpansionConfig = toml::from_str("hot_reload = false").unwrap();
        assert!(config.enabled);
        assert!(!config.hot_reload);
        assert_eq!(config.hot_reload_interval_ms, 1000);
        assert_eq!(config.fuel_per_call, DEFAULT_FUEL_PER_CALL);
        assert!(config.dir().ends_with("expansions"));
    }

    #[test]
    fn test_explicit_dir_wins() {
        let config: ExpansionConfig = toml::from_str("dir = \"/srv/rules/expansions\"").unwrap();
        assert_eq!(config.dir(), PathBuf::from("/srv/rules/expansions"));
    }
}
