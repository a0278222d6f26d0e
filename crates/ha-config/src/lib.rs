//! YAML configuration loading for the backup server
//!
//! Reads `configuration.yaml` with Home Assistant's custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR` - Environment variable substitution
//!
//! and exposes the `http:` and `backup:` sections as typed structs.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::ServerConfig;
//!
//! let config = ServerConfig::load("/config")?;
//! for entry in &config.backup.agents {
//!     println!("{}.{}", entry.domain, entry.entry_id);
//! }
//! ```

mod error;
mod loader;
mod secrets;
mod server_config;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;
pub use server_config::{AgentEntryConfig, BackupSection, HttpConfig, ServerConfig, CONFIG_FILE};

// Re-export serde_yaml::Value for agent platforms reading options
pub use serde_yaml::Value;
