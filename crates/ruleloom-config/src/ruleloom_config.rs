use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    expansion_config::ExpansionConfig,
    paths::{ProjectPaths, APP_NAME},
};

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("could not determine the config directory")]
    NoConfigDir,

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("could not determine the config directory")]
    NoConfigDir,

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error writing config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Length of one scheduler tick in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval() -> u64 {
    50
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to <data dir>/logs
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleloomConfig {
    #[serde(default)]
    pub expansions: ExpansionConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuleloomConfig {
    pub fn config_path() -> Option<PathBuf> {
        ProjectPaths::new(APP_NAME).map(|p| p.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = Self::config_path().ok_or(ConfigLoadError::NoConfigDir)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigSaveError> {
        let path = Self::config_path().ok_or(ConfigSaveError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigSaveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }
}
