//! Creating, receiving and restoring archives
//!
//! The manager decides *what* happens; a [`BackupReaderWriter`] does the
//! file work. [`CoreBackupReaderWriter`] handles plain core installs where
//! only the config directory is backed up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{ByteStream, LocalBackupAgent, OpenStream};
use crate::archive::{
    file_stream, generate_backup_id, read_backup, validate_backup_id, write_backup_archive,
    write_stream, BackupJson,
};
use crate::constants::{HA_VERSION, RESTORE_BACKUP_FILE, TEMP_BACKUP_DIR};
use crate::error::{BackupReaderWriterError, ReaderWriterResult};
use crate::events::{CreateBackupStage, ManagerStateEvent, OperationState};
use crate::models::{AgentBackup, ExtraMetadata, Folder};
use crate::restore::RestoreFileContent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBackup {
    pub backup_job_id: String,
}

/// Frees whatever backs a [`WrittenBackup`]'s stream once uploads are done
pub type ReleaseStream = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub type ProgressCallback = Arc<dyn Fn(ManagerStateEvent) + Send + Sync>;

pub struct WrittenBackup {
    pub backup: AgentBackup,
    pub open_stream: OpenStream,
    pub release_stream: ReleaseStream,
}

/// Integration hooks run around backup generation
#[async_trait]
pub trait BackupPlatform: Send + Sync {
    /// e.g. flush a database to disk
    async fn pre_backup(&self) -> ReaderWriterResult<()>;

    async fn post_backup(&self) -> ReaderWriterResult<()>;
}

pub struct CreateBackupArgs {
    pub agent_ids: Vec<String>,
    pub backup_name: String,
    pub extra_metadata: ExtraMetadata,
    pub include_addons: Option<Vec<String>>,
    pub include_all_addons: bool,
    pub include_database: bool,
    pub include_folders: Option<Vec<Folder>>,
    pub include_homeassistant: bool,
    pub on_progress: ProgressCallback,
    pub password: Option<String>,
    /// Set when a local agent is among `agent_ids`
    pub local_agent: Option<Arc<dyn LocalBackupAgent>>,
    pub platforms: Vec<Arc<dyn BackupPlatform>>,
}

pub struct ReceiveBackupArgs {
    pub stream: ByteStream,
    pub suggested_filename: String,
    pub local_agent: Option<Arc<dyn LocalBackupAgent>>,
}

pub struct RestoreBackupArgs {
    pub backup_id: String,
    pub open_stream: OpenStream,
    /// Set when restoring from a local agent
    pub local_agent: Option<Arc<dyn LocalBackupAgent>>,
    pub password: Option<String>,
    pub restore_addons: Option<Vec<String>>,
    pub restore_database: bool,
    pub restore_folders: Option<Vec<Folder>>,
    pub restore_homeassistant: bool,
}

pub type BackupTask = JoinHandle<ReaderWriterResult<WrittenBackup>>;

#[async_trait]
pub trait BackupReaderWriter: Send + Sync {
    /// Validate and start generating a backup in the background
    async fn create_backup(&self, args: CreateBackupArgs)
        -> ReaderWriterResult<(NewBackup, BackupTask)>;

    /// Store an uploaded archive so it can be handed to agents
    async fn receive_backup(&self, args: ReceiveBackupArgs) -> ReaderWriterResult<WrittenBackup>;

    async fn restore_backup(&self, args: RestoreBackupArgs) -> ReaderWriterResult<()>;
}

/// Reader/writer for installs without a supervisor
pub struct CoreBackupReaderWriter {
    config_dir: PathBuf,
    temp_backup_dir: PathBuf,
    restart: Arc<dyn Fn() + Send + Sync>,
}

impl CoreBackupReaderWriter {
    /// `restart` is called once a restore has been staged
    pub fn new(config_dir: impl Into<PathBuf>, restart: Arc<dyn Fn() + Send + Sync>) -> Self {
        let config_dir = config_dir.into();
        Self {
            temp_backup_dir: config_dir.join(TEMP_BACKUP_DIR),
            config_dir,
            restart,
        }
    }

    pub fn temp_backup_dir(&self) -> &Path {
        &self.temp_backup_dir
    }
}

async fn run_platform_hooks(
    platforms: &[Arc<dyn BackupPlatform>],
    pre: bool,
) -> ReaderWriterResult<()> {
    let results = join_all(platforms.iter().map(|platform| async move {
        if pre {
            platform.pre_backup().await
        } else {
            platform.post_backup().await
        }
    }))
    .await;
    results.into_iter().collect()
}

fn open_file(path: PathBuf) -> OpenStream {
    crate::agent::open_stream_fn(move || file_stream(path.clone()))
}

fn remove_file_later(path: PathBuf) -> ReleaseStream {
    Box::new(move || {
        async move {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Unable to remove {}: {}", path.display(), err);
                }
            }
        }
        .boxed()
    })
}

fn keep_file() -> ReleaseStream {
    Box::new(|| async {}.boxed())
}

/// Keep only the final path component of a client-supplied file name
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("backup.tar")
        .to_string()
}

#[async_trait]
impl BackupReaderWriter for CoreBackupReaderWriter {
    async fn create_backup(
        &self,
        args: CreateBackupArgs,
    ) -> ReaderWriterResult<(NewBackup, BackupTask)> {
        let date = chrono::Local::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        let backup_id = generate_backup_id(&date, &args.backup_name);

        let has_addons = args.include_addons.as_ref().map_or(false, |a| !a.is_empty());
        let has_folders = args.include_folders.as_ref().map_or(false, |f| !f.is_empty());
        if has_addons || args.include_all_addons || has_folders {
            return Err(BackupReaderWriterError::AddonsNotSupported);
        }
        if !args.include_homeassistant {
            return Err(BackupReaderWriterError::HomeAssistantRequired);
        }
        if args.password.is_some() {
            return Err(BackupReaderWriterError::PasswordNotSupported);
        }

        let tar_path = match &args.local_agent {
            Some(local) => local.backup_path(&backup_id),
            None => self.temp_backup_dir.join(format!("{}.tar", backup_id)),
        };
        let in_local_dir = args.local_agent.is_some();
        let config_dir = self.config_dir.clone();
        let new_backup = NewBackup {
            backup_job_id: backup_id.clone(),
        };

        let task = tokio::spawn(async move {
            (args.on_progress)(ManagerStateEvent::create(
                Some(CreateBackupStage::HomeAssistant),
                OperationState::InProgress,
            ));

            let written = async {
                run_platform_hooks(&args.platforms, true).await?;
                let backup_json = BackupJson::for_core_backup(
                    &backup_id,
                    &args.backup_name,
                    &date,
                    args.include_database,
                    false,
                    args.extra_metadata.clone(),
                    HA_VERSION,
                );
                let write_path = tar_path.clone();
                let include_database = args.include_database;
                let size = tokio::task::spawn_blocking(move || {
                    write_backup_archive(&config_dir, &write_path, &backup_json, include_database)
                })
                .await
                .map_err(|e| BackupReaderWriterError::Interrupted(e.to_string()))??;
                Ok::<_, BackupReaderWriterError>(size)
            }
            .await;

            // Post hooks run whether or not generation worked
            let post = run_platform_hooks(&args.platforms, false).await;
            let size = written?;
            post?;

            info!("Generated backup {} at {}", backup_id, tar_path.display());
            let backup = AgentBackup {
                addons: Vec::new(),
                backup_id,
                database_included: args.include_database,
                date,
                extra_metadata: args.extra_metadata,
                folders: Vec::new(),
                homeassistant_included: true,
                homeassistant_version: Some(HA_VERSION.to_string()),
                name: args.backup_name,
                protected: false,
                size,
            };
            let release_stream = if in_local_dir {
                keep_file()
            } else {
                remove_file_later(tar_path.clone())
            };
            Ok(WrittenBackup {
                backup,
                open_stream: open_file(tar_path),
                release_stream,
            })
        });

        Ok((new_backup, task))
    }

    async fn receive_backup(&self, args: ReceiveBackupArgs) -> ReaderWriterResult<WrittenBackup> {
        let temp_file = self
            .temp_backup_dir
            .join(sanitize_filename(&args.suggested_filename));
        write_stream(args.stream, &temp_file).await?;

        let read_path = temp_file.clone();
        let parsed = tokio::task::spawn_blocking(move || read_backup(&read_path))
            .await
            .map_err(|e| BackupReaderWriterError::Interrupted(e.to_string()))?;
        let backup = match parsed {
            Ok(backup) => backup,
            Err(err) => {
                warn!("Unable to parse backup {}: {}", temp_file.display(), err);
                let _ = tokio::fs::remove_file(&temp_file).await;
                return Err(err);
            }
        };

        let (tar_path, release_stream) = match &args.local_agent {
            Some(local) => {
                let path = local.backup_path(&backup.backup_id);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&temp_file, &path).await?;
                (path, keep_file())
            }
            None => (temp_file.clone(), remove_file_later(temp_file)),
        };
        debug!("Received backup {} at {}", backup.backup_id, tar_path.display());

        Ok(WrittenBackup {
            backup,
            open_stream: open_file(tar_path),
            release_stream,
        })
    }

    async fn restore_backup(&self, args: RestoreBackupArgs) -> ReaderWriterResult<()> {
        let has_addons = args.restore_addons.as_ref().map_or(false, |a| !a.is_empty());
        let has_folders = args.restore_folders.as_ref().map_or(false, |f| !f.is_empty());
        if has_addons || has_folders {
            return Err(BackupReaderWriterError::AddonsNotSupportedInRestore);
        }
        if !args.restore_homeassistant && !args.restore_database {
            return Err(BackupReaderWriterError::NothingToRestore);
        }
        if args.password.is_some() {
            return Err(BackupReaderWriterError::PasswordNotSupported);
        }
        validate_backup_id(&args.backup_id)?;

        let local_path = match &args.local_agent {
            Some(local) => {
                let path = local.backup_path(&args.backup_id);
                tokio::fs::try_exists(&path)
                    .await
                    .unwrap_or(false)
                    .then_some(path)
            }
            None => None,
        };
        let (path, remove_after_restore) = match local_path {
            Some(path) => (path, false),
            None => {
                let path = self
                    .temp_backup_dir
                    .join(format!("{}.tar", args.backup_id));
                write_stream((args.open_stream)().await?, &path).await?;
                (path, true)
            }
        };

        let content = RestoreFileContent {
            path,
            password: args.password,
            remove_after_restore,
            restore_database: args.restore_database,
            restore_homeassistant: args.restore_homeassistant,
        };
        let raw = serde_json::to_vec(&content)
            .map_err(|e| BackupReaderWriterError::InvalidArchive(e.to_string()))?;
        tokio::fs::write(self.config_dir.join(RESTORE_BACKUP_FILE), raw).await?;

        info!("Restore of backup {} staged, restarting", args.backup_id);
        (self.restart)();
        Ok(())
    }
}
