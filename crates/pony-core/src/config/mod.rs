mod dirs;
mod settings;
mod validation;

pub use dirs::{CONFIG_DIR_ENV, Directories};
pub use settings::{
    AgentConfig, Config, DEFAULT_HUB, DatabaseConfig, HubConfig, ManagementConfig,
    MessagingConfig, ReconnectConfig,
};
pub use validation::warn_unknown_fields;
