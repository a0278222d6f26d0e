//! YAML loader with Home Assistant tag support
//!
//! Handles the tags that matter for backup configuration:
//! - `!include path` - splice another YAML file in place
//! - `!secret key` - substitute a value from secrets.yaml
//! - `!env_var VAR` - substitute an environment variable

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, for cycle detection
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    /// Create a loader for `config_dir`, reading its secrets.yaml
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: HashSet::new(),
        }
    }

    /// Load and resolve a YAML file, relative paths resolve against the config dir
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = if path.as_ref().is_absolute() {
            path.as_ref().to_path_buf()
        } else {
            self.config_dir.join(path)
        };
        debug!("Loading YAML file: {:?}", path);

        if !self.include_stack.insert(path.clone()) {
            return Err(ConfigError::CircularInclude { path });
        }

        let result = fs::read_to_string(&path)
            .map_err(|source| ConfigError::ReadFile {
                path: path.clone(),
                source,
            })
            .and_then(|content| self.load_str(&content, &path));

        self.include_stack.remove(&path);
        result
    }

    /// Resolve YAML text; `source_path` anchors relative includes
    pub fn load_str(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;
        self.resolve(value, source_path)
    }

    fn resolve(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k, self.resolve(v, source_path)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.resolve(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Resolving tag {}", tag);

        match tag.as_str() {
            "!include" => {
                let target = tag_argument(&tag, tagged.value)?;
                let base = source_path.parent().unwrap_or(&self.config_dir);
                let path = if Path::new(&target).is_absolute() {
                    PathBuf::from(&target)
                } else {
                    base.join(&target)
                };
                if path.extension().map_or(true, |ext| ext != "yaml" && ext != "yml") {
                    return Err(ConfigError::InvalidIncludePath {
                        path: target,
                        reason: "only .yaml and .yml files can be included".to_string(),
                    });
                }
                self.load_file(path)
            }
            "!secret" => {
                let key = tag_argument(&tag, tagged.value)?;
                let secret = self.secrets.get(&key)?;
                debug!("Substituted secret: {}", key);
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let var = tag_argument(&tag, tagged.value)?;
                std::env::var(&var)
                    .map(Value::String)
                    .map_err(|_| ConfigError::EnvVarNotFound { var })
            }
            _ => {
                let inner = self.resolve(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value: inner,
                })))
            }
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: format!("expected a string argument, got {:?}", other),
        }),
    }
}

/// Load `file` from `config_dir` with full tag resolution
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}
