//! Typed sections of configuration.yaml
//!
//! Only the sections the backup server consumes are modelled: `http:` for
//! the API listener and `backup:` for remote agent entries. Anything else in
//! the file is ignored.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

pub const CONFIG_FILE: &str = "configuration.yaml";

/// `http:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8123
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// One remote backup agent, the YAML stand-in for a config entry
///
/// `domain` picks the agent platform, `entry_id` makes the agent id
/// `{domain}.{entry_id}`. Keys other than the three known ones are passed to
/// the platform untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntryConfig {
    pub domain: String,
    pub entry_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl AgentEntryConfig {
    /// Title shown to users, falls back to the entry id
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.entry_id)
    }

    /// String option lookup
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer option lookup
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }
}

/// `backup:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSection {
    #[serde(default)]
    pub agents: Vec<AgentEntryConfig>,
}

impl BackupSection {
    fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.agents {
            if entry.domain.is_empty() || entry.entry_id.is_empty() {
                return Err(ConfigError::InvalidSection {
                    section: "backup".to_string(),
                    reason: "agent entries need a non-empty domain and entry_id".to_string(),
                });
            }
            if !seen.insert((entry.domain.as_str(), entry.entry_id.as_str())) {
                return Err(ConfigError::DuplicateAgentEntry {
                    domain: entry.domain.clone(),
                    entry_id: entry.entry_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Everything the server reads from configuration.yaml
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub backup: BackupSection,
}

impl ServerConfig {
    /// Load from `<config_dir>/configuration.yaml`; a missing file means defaults
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            tracing::info!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir);
            return Ok(Self::default());
        }
        let yaml = load_yaml(config_dir, CONFIG_FILE)?;
        Self::from_yaml(&yaml)
    }

    /// Parse an already-resolved YAML document
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let mapping = match yaml {
            Value::Mapping(m) => m,
            Value::Null => return Ok(Self::default()),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        let http: HttpConfig = section(mapping, "http")?;
        let backup: BackupSection = section(mapping, "backup")?;
        backup.validate()?;

        Ok(Self { http, backup })
    }
}

/// Deserialize a top-level section; absent or `null` means its default
fn section<T>(mapping: &serde_yaml::Mapping, name: &str) -> ConfigResult<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    match mapping.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::InvalidSection {
                section: name.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.http.bind_addr(), "0.0.0.0:8123");
        assert!(config.backup.agents.is_empty());
    }

    #[test]
    fn test_parse_agents_with_options() {
        let yaml: Value = serde_yaml::from_str(
            r#"
homeassistant:
  name: Home
http:
  server_port: 8124
backup:
  agents:
    - domain: nas
      entry_id: attic
      title: Attic NAS
      path: /mnt/attic
      page_size: 500
    - domain: memory
      entry_id: scratch
"#,
        )
        .unwrap();

        let config = ServerConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.http.bind_addr(), "0.0.0.0:8124");
        assert_eq!(config.backup.agents.len(), 2);

        let nas = &config.backup.agents[0];
        assert_eq!(nas.display_name(), "Attic NAS");
        assert_eq!(nas.option_str("path"), Some("/mnt/attic"));
        assert_eq!(nas.option_u64("page_size"), Some(500));

        let memory = &config.backup.agents[1];
        assert_eq!(memory.display_name(), "scratch");
        assert!(memory.options.is_empty());
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let yaml: Value = serde_yaml::from_str(
            r#"
backup:
  agents:
    - domain: nas
      entry_id: attic
    - domain: nas
      entry_id: attic
"#,
        )
        .unwrap();

        let result = ServerConfig::from_yaml(&yaml);
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateAgentEntry { .. })
        ));
    }

    #[test]
    fn test_malformed_section() {
        let yaml: Value = serde_yaml::from_str("backup:\n  agents: nope\n").unwrap();
        let result = ServerConfig::from_yaml(&yaml);
        assert!(matches!(result, Err(ConfigError::InvalidSection { .. })));
    }

    #[test]
    fn test_load_from_disk_with_secret() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("secrets.yaml"), "attic_path: /srv/attic\n").unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "backup:\n  agents:\n    - domain: nas\n      entry_id: attic\n      path: !secret attic_path\n",
        )
        .unwrap();

        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(
            config.backup.agents[0].option_str("path"),
            Some("/srv/attic")
        );
    }
}
