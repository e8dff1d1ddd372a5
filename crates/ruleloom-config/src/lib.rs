pub mod expansion_config;
pub mod paths;
pub mod ruleloom_config;

pub use expansion_config::ExpansionConfig;
pub use paths::{ProjectPaths, APP_NAME};
pub use ruleloom_config::{
    ConfigLoadError, ConfigSaveError, LoggingConfig, RuleloomConfig, SchedulerConfig,
};
