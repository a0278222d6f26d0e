//! Backup error types

use thiserror::Error;

use crate::events::BackupManagerState;
use crate::store::StoreError;

/// The one error type agents may return
///
/// Backend failures (HTTP, SDK, I/O, timeouts) are converted into this at the
/// agent boundary so the manager never sees backend-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackupAgentError {
    #[error("The backup agent is unreachable.")]
    Unreachable,

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl BackupAgentError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<std::io::Error> for BackupAgentError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(format!("I/O error: {}", err))
    }
}

pub type AgentResult<T> = Result<T, BackupAgentError>;

/// Errors from creating, receiving or restoring archives
#[derive(Debug, Error)]
pub enum BackupReaderWriterError {
    #[error("Addons and folders are not supported by core backup")]
    AddonsNotSupported,

    #[error("Addons and folders are not supported in core restore")]
    AddonsNotSupportedInRestore,

    #[error("Home Assistant must be included in backup")]
    HomeAssistantRequired,

    #[error("Home Assistant or database must be included in restore")]
    NothingToRestore,

    #[error("Password protected backups are not supported")]
    PasswordNotSupported,

    #[error("Invalid backup archive: {0}")]
    InvalidArchive(String),

    #[error("Pre-backup action failed: {0}")]
    PreBackup(String),

    #[error("Backup generation was interrupted: {0}")]
    Interrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReaderWriterResult<T> = Result<T, BackupReaderWriterError>;

/// Errors from [`crate::BackupManager`] operations
#[derive(Debug, Error)]
pub enum BackupManagerError {
    #[error("Backup manager busy: {0}")]
    Busy(BackupManagerState),

    #[error("At least one agent must be selected")]
    NoAgentsSelected,

    #[error("Invalid agents selected: {0:?}")]
    InvalidAgents(Vec<String>),

    #[error("Cannot include all addons and specify specific addons")]
    ConflictingAddonSelection,

    #[error("Backup {backup_id} not found in agent {agent_id}")]
    BackupNotFound { backup_id: String, agent_id: String },

    #[error("Invalid backup configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Agent(#[from] BackupAgentError),

    #[error(transparent)]
    ReaderWriter(#[from] BackupReaderWriterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ManagerResult<T> = Result<T, BackupManagerError>;
