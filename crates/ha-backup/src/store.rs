//! `.storage/backup` persistence
//!
//! Same on-disk shape as every other `.storage/` file:
//! `{"version", "minor_version", "key", "data"}`, written atomically.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::BackupConfigData;

pub const STORAGE_KEY: &str = "backup";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 5;

const INSTANCE_ID_KEY: &str = "core.uuid";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Migration required for {key}: from {from} to {to}")]
    MigrationRequired { key: String, from: u32, to: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Versioned wrapper around stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

/// Upload failures remembered per backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBackup {
    pub backup_id: String,
    pub failed_agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredBackupData {
    #[serde(default)]
    pub backups: Vec<StoredBackup>,
    #[serde(default)]
    pub config: BackupConfigData,
}

impl StoredBackupData {
    pub fn failed_agent_ids(&self, backup_id: &str) -> &[String] {
        self.backups
            .iter()
            .find(|b| b.backup_id == backup_id)
            .map(|b| b.failed_agent_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the failures recorded for `backup_id`; empty clears the record
    pub fn set_failed_agent_ids(&mut self, backup_id: &str, failed_agent_ids: Vec<String>) {
        self.backups.retain(|b| b.backup_id != backup_id);
        if !failed_agent_ids.is_empty() {
            self.backups.push(StoredBackup {
                backup_id: backup_id.to_string(),
                failed_agent_ids,
            });
        }
    }
}

/// Reads and writes files under `<config>/.storage`
#[derive(Debug, Clone)]
pub struct BackupStore {
    storage_dir: PathBuf,
}

impl BackupStore {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<StorageFile<T>>> {
        let path = self.file_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Storage file not found: {}", key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn write<T: Serialize>(&self, file: &StorageFile<T>) -> StoreResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;
        let path = self.file_path(&file.key);
        let temp_path = self.file_path(&format!("{}.tmp", file.key));

        fs::write(&temp_path, serde_json::to_string_pretty(file)?).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            "Saved storage file: {} (v{}.{})",
            file.key, file.version, file.minor_version
        );
        Ok(())
    }

    /// Load backup data; `None` on first start
    pub async fn load(&self) -> StoreResult<Option<StoredBackupData>> {
        let Some(file) = self.read::<StoredBackupData>(STORAGE_KEY).await? else {
            return Ok(None);
        };
        if file.version != STORAGE_VERSION {
            return Err(StoreError::MigrationRequired {
                key: STORAGE_KEY.to_string(),
                from: file.version,
                to: STORAGE_VERSION,
            });
        }
        if file.minor_version < STORAGE_MINOR_VERSION {
            // Newer minor versions only add defaulted fields
            warn!(
                "Storage {} has older minor version ({} < {}), upgrading on next save",
                STORAGE_KEY, file.minor_version, STORAGE_MINOR_VERSION
            );
        }
        Ok(Some(file.data))
    }

    pub async fn save(&self, data: &StoredBackupData) -> StoreResult<()> {
        self.write(&StorageFile {
            version: STORAGE_VERSION,
            minor_version: STORAGE_MINOR_VERSION,
            key: STORAGE_KEY.to_string(),
            data,
        })
        .await
    }

    /// Id of this installation, created on first use
    pub async fn instance_id(&self) -> StoreResult<String> {
        #[derive(Serialize, Deserialize)]
        struct InstanceId {
            uuid: String,
        }

        if let Some(file) = self.read::<InstanceId>(INSTANCE_ID_KEY).await? {
            return Ok(file.data.uuid);
        }

        let uuid = uuid::Uuid::new_v4().simple().to_string();
        self.write(&StorageFile {
            version: 1,
            minor_version: 1,
            key: INSTANCE_ID_KEY.to_string(),
            data: InstanceId { uuid: uuid.clone() },
        })
        .await?;
        info!("Created instance id {}", uuid);
        Ok(uuid)
    }
}
