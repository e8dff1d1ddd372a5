use std::path::PathBuf;

use directories::ProjectDirs;

/// Application name used for every platform directory
pub const APP_NAME: &str = "ruleloom";

/// Platform-specific directories for an application.
///
/// On Linux these follow the XDG base directory spec
/// (`~/.config/{name}`, `~/.local/share/{name}`, `~/.cache/{name}`); macOS
/// and Windows use their native locations.
pub struct ProjectPaths {
    dirs: ProjectDirs,
}

impl ProjectPaths {
    /// Returns `None` when no home directory can be determined
    pub fn new(name: &str) -> Option<Self> {
        ProjectDirs::from("", "", name).map(|dirs| ProjectPaths { dirs })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dirs.config_dir().to_path_buf()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dirs.data_dir().to_path_buf()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dirs.cache_dir().to_path_buf()
    }
}

/// Data directory of the application, or a relative fallback
pub fn data_dir_or_local() -> PathBuf {
    ProjectPaths::new(APP_NAME)
        .map(|p| p.data_dir())
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_NAME)))
}
