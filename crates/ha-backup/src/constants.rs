//! Constants shared by the backup manager, agents and reader/writer

/// Integration domain
pub const DOMAIN: &str = "backup";

/// Agent id of the built-in filesystem agent
pub const LOCAL_AGENT_ID: &str = "backup.local";

/// Chunk size for file streams
pub const BUF_SIZE: usize = 1 << 20;

/// Version written into backup metadata
pub const HA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker file consumed on startup to restore a backup
pub const RESTORE_BACKUP_FILE: &str = ".HA_RESTORE";

/// Directory (under the config dir) holding local backups
pub const BACKUP_DIR: &str = "backups";

/// Directory (under the config dir) for archives not kept by the local agent
pub const TEMP_BACKUP_DIR: &str = "tmp_backups";

/// Glob patterns, relative to the config dir, never written into a backup
pub const EXCLUDE_FROM_BACKUP: &[&str] = &[
    "__pycache__/*",
    ".DS_Store",
    ".HA_RESTORE",
    "*.db-shm",
    "*.log.*",
    "*.log",
    "backups/*.tar",
    "backups/*.part",
    "tmp_backups/*.tar",
    "tmp_backups/*.part",
    "OZW_Log.txt",
    "tts/*",
];

/// Additional patterns when the database is left out
pub const EXCLUDE_DATABASE_FROM_BACKUP: &[&str] =
    &["home-assistant_v2.db", "home-assistant_v2.db-wal"];
