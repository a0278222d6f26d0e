//! Applying a staged restore at startup
//!
//! A restore only writes `.HA_RESTORE` and restarts. The next start calls
//! [`restore_backup_file`] before anything reads the config directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::extract_data;
use crate::constants::{
    BACKUP_DIR, EXCLUDE_DATABASE_FROM_BACKUP, RESTORE_BACKUP_FILE, TEMP_BACKUP_DIR,
};
use crate::error::{BackupReaderWriterError, ReaderWriterResult};

/// Contents of `.HA_RESTORE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFileContent {
    pub path: PathBuf,
    pub password: Option<String>,
    pub remove_after_restore: bool,
    pub restore_database: bool,
    pub restore_homeassistant: bool,
}

/// Read and consume the restore marker
///
/// The marker is removed even when it can't be parsed so a bad marker
/// can't cause a restore loop.
pub fn take_restore_file(config_dir: &Path) -> Option<RestoreFileContent> {
    let marker = config_dir.join(RESTORE_BACKUP_FILE);
    let raw = match fs::read_to_string(&marker) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Unable to read {}: {}", marker.display(), e);
            return None;
        }
    };
    if let Err(e) = fs::remove_file(&marker) {
        warn!("Unable to remove {}: {}", marker.display(), e);
    }
    match serde_json::from_str(&raw) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("Invalid {}: {}", RESTORE_BACKUP_FILE, e);
            None
        }
    }
}

/// Apply a pending restore; `Ok(false)` when there is none
///
/// Blocking; runs before the server starts.
pub fn restore_backup_file(config_dir: &Path) -> ReaderWriterResult<bool> {
    let Some(content) = take_restore_file(config_dir) else {
        return Ok(false);
    };
    if content.password.is_some() {
        return Err(BackupReaderWriterError::PasswordNotSupported);
    }
    if !content.path.exists() {
        return Err(BackupReaderWriterError::InvalidArchive(format!(
            "Backup file {} does not exist",
            content.path.display()
        )));
    }

    info!("Restoring {}", content.path.display());
    let scratch = tempfile::TempDir::new()?;
    let data = extract_data(&content.path, scratch.path())?;

    let mut keep: Vec<&str> = vec![BACKUP_DIR, TEMP_BACKUP_DIR];
    if !content.restore_database {
        keep.extend_from_slice(EXCLUDE_DATABASE_FROM_BACKUP);
    }

    if content.restore_homeassistant {
        clear_directory(config_dir, &keep)?;
        copy_tree(&data, config_dir, &keep)?;
    } else {
        for name in EXCLUDE_DATABASE_FROM_BACKUP {
            let src = data.join(name);
            if src.exists() {
                fs::copy(&src, config_dir.join(name))?;
            }
        }
    }

    if content.remove_after_restore {
        if let Err(e) = fs::remove_file(&content.path) {
            warn!("Unable to remove {}: {}", content.path.display(), e);
        }
    }
    info!("Restore complete");
    Ok(true)
}

/// Remove every top-level entry of `dir` not named in `keep`
fn clear_directory(dir: &Path, keep: &[&str]) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if keep.iter().any(|k| entry.file_name() == *k) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Copy `src` into `dst`, skipping top-level entries named in `skip`
fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if skip.iter().any(|k| entry.file_name() == *k) {
            continue;
        }
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target, &[])?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
