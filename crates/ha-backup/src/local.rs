//! Local filesystem backup agent

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::{not_found, BackupAgent, ByteStream, LocalBackupAgent, OpenStream};
use crate::archive::{file_stream, is_valid_backup_id, read_backup, write_stream};
use crate::constants::{BACKUP_DIR, DOMAIN};
use crate::error::{AgentResult, BackupAgentError};
use crate::models::AgentBackup;

/// Agent `backup.local`, archives under `<config>/backups`
///
/// Metadata lives inside each archive, so the directory is scanned once on
/// first use and the index kept in memory afterwards.
pub struct CoreLocalBackupAgent {
    backup_dir: PathBuf,
    backups: Mutex<Option<HashMap<String, (AgentBackup, PathBuf)>>>,
}

impl CoreLocalBackupAgent {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            backup_dir: config_dir.as_ref().join(BACKUP_DIR),
            backups: Mutex::new(None),
        }
    }

    /// Run `f` against the loaded index
    async fn with_index<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, (AgentBackup, PathBuf)>) -> T,
    ) -> AgentResult<T> {
        let mut guard = self.backups.lock().await;
        if guard.is_none() {
            *guard = Some(self.scan().await?);
        }
        match guard.as_mut() {
            Some(index) => Ok(f(index)),
            None => Err(BackupAgentError::failed("local backup index unavailable")),
        }
    }

    async fn scan(&self) -> AgentResult<HashMap<String, (AgentBackup, PathBuf)>> {
        let dir = self.backup_dir.clone();
        let index = tokio::task::spawn_blocking(move || scan_dir(&dir))
            .await
            .map_err(|e| BackupAgentError::failed(format!("Scanning backups failed: {}", e)))??;
        debug!("Loaded {} local backups", index.len());
        Ok(index)
    }
}

fn scan_dir(dir: &Path) -> std::io::Result<HashMap<String, (AgentBackup, PathBuf)>> {
    let mut index = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "tar") {
            continue;
        }
        match read_backup(&path) {
            Ok(backup) => {
                index.insert(backup.backup_id.clone(), (backup, path));
            }
            Err(err) => warn!("Unable to read backup {}: {}", path.display(), err),
        }
    }
    Ok(index)
}

#[async_trait]
impl BackupAgent for CoreLocalBackupAgent {
    fn domain(&self) -> &str {
        DOMAIN
    }

    fn unique_id(&self) -> &str {
        "local"
    }

    fn name(&self) -> &str {
        "local"
    }

    async fn list_backups(&self) -> AgentResult<Vec<AgentBackup>> {
        self.with_index(|index| index.values().map(|(b, _)| b.clone()).collect())
            .await
    }

    async fn get_backup(&self, backup_id: &str) -> AgentResult<Option<AgentBackup>> {
        let entry = self
            .with_index(|index| index.get(backup_id).cloned())
            .await?;
        let Some((backup, path)) = entry else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Removing tracked backup {} that does not exist", backup_id);
            self.with_index(|index| index.remove(backup_id)).await?;
            return Ok(None);
        }
        Ok(Some(backup))
    }

    async fn upload_backup(&self, open_stream: OpenStream, backup: &AgentBackup) -> AgentResult<()> {
        if !is_valid_backup_id(&backup.backup_id) {
            return Err(BackupAgentError::failed(format!(
                "Invalid backup id {:?}",
                backup.backup_id
            )));
        }
        let path = self.backup_path(&backup.backup_id);
        // The reader/writer usually wrote the archive here already
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            write_stream(open_stream().await?, &path).await?;
        }
        self.with_index(|index| {
            index.insert(backup.backup_id.clone(), (backup.clone(), path));
        })
        .await
    }

    async fn download_backup(&self, backup_id: &str) -> AgentResult<ByteStream> {
        let path = self
            .with_index(|index| index.get(backup_id).map(|(_, p)| p.clone()))
            .await?
            .ok_or_else(|| not_found(backup_id))?;
        match file_stream(&path).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(backup_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_backup(&self, backup_id: &str) -> AgentResult<()> {
        let tracked = self
            .with_index(|index| index.remove(backup_id).map(|(_, p)| p))
            .await?;
        let Some(path) = tracked.or_else(|| {
            is_valid_backup_id(backup_id).then(|| self.backup_path(backup_id))
        }) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed backup {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

impl LocalBackupAgent for CoreLocalBackupAgent {
    fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.tar", backup_id))
    }
}
