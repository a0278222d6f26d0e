//! `secrets.yaml` lookup
//!
//! Credentials for remote backup agents (bucket keys, NAS passwords) are
//! usually kept out of `configuration.yaml` and referenced with `!secret`.

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Secrets store loaded from secrets.yaml
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl Secrets {
    /// Load secrets from `<config_dir>/secrets.yaml`
    ///
    /// A missing file yields an empty store; every `!secret` lookup will
    /// then fail with [`ConfigError::SecretNotFound`].
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join("secrets.yaml");
        if !path.exists() {
            debug!("No secrets.yaml at {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: PathBuf) -> ConfigResult<Self> {
        let raw: HashMap<String, Value> =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;

        let values: HashMap<String, String> = raw
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key, v)))
            .collect();

        debug!("Loaded {} secrets from {:?}", values.len(), path);
        Ok(Self {
            values,
            path: Some(path),
        })
    }

    /// Look up a secret by key
    pub fn get(&self, key: &str) -> ConfigResult<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
            })
    }

    /// Path of the file the secrets came from, if one existed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Secrets are substituted as strings; nested structures are skipped.
fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}
