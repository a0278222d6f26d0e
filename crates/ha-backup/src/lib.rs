//! Backups
//!
//! This crate provides the backup manager and the agent protocol it talks
//! to. An agent is one place archives are stored (the local `backups/`
//! directory, a NAS share, an object store). The manager fans every
//! operation out to all agents concurrently and reports per-agent failures
//! next to the results instead of failing the whole operation.
//!
//! # Key Types
//!
//! - [`BackupAgent`] - Storage backend contract
//! - [`CoreLocalBackupAgent`] - Archives in `<config>/backups`
//! - [`BackupManager`] - Fan-out, state machine, automatic backups
//! - [`CoreBackupReaderWriter`] - Writes, receives and stages archives
//!
//! # Storage
//!
//! Settings and upload failures are persisted in `.storage/backup`.

pub mod agent;
pub mod archive;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod local;
pub mod manager;
pub mod models;
pub mod reader_writer;
pub mod restore;
pub mod scheduler;
pub mod store;

pub use agent::{open_stream_fn, BackupAgent, ByteStream, LocalBackupAgent, OpenStream};
pub use archive::{suggested_filename, BackupJson};
pub use config::{
    BackupConfigData, BackupConfigUpdate, CreateBackupParams, RetentionConfig, ScheduleConfig,
    ScheduleRecurrence,
};
pub use constants::{DOMAIN, HA_VERSION, LOCAL_AGENT_ID};
pub use error::{
    AgentResult, BackupAgentError, BackupManagerError, BackupReaderWriterError, ManagerResult,
    ReaderWriterResult,
};
pub use events::{BackupManagerState, ManagerStateEvent, OperationState};
pub use local::CoreLocalBackupAgent;
pub use manager::{AgentErrors, BackupManager, RestoreBackupParams};
pub use models::{AgentBackup, AgentBackupStatus, BackupAgentInfo, Folder, ManagerBackup};
pub use reader_writer::{BackupPlatform, BackupReaderWriter, CoreBackupReaderWriter, NewBackup};
pub use restore::restore_backup_file;
pub use scheduler::spawn_scheduler;
pub use store::{BackupStore, StoreError};
