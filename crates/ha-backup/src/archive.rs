//! Backup archive format
//!
//! An archive is an uncompressed tar holding `backup.json` and
//! `homeassistant.tar.gz`; the inner gzip tar holds the config directory
//! under `data/`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::agent::ByteStream;
use crate::constants::{BUF_SIZE, EXCLUDE_DATABASE_FROM_BACKUP, EXCLUDE_FROM_BACKUP};
use crate::error::{BackupReaderWriterError, ReaderWriterResult};
use crate::models::{AddonInfo, AgentBackup, ExtraMetadata, Folder};

pub const BACKUP_JSON: &str = "backup.json";
pub const HOMEASSISTANT_TAR: &str = "homeassistant.tar.gz";
const DATA_DIR: &str = "data";

/// Short id derived from date and name
pub fn generate_backup_id(date: &str, name: &str) -> String {
    let digest = Sha1::digest(format!("{} - {}", date, name).to_lowercase().as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Backup ids become file names; only ASCII alphanumerics, `-` and `_`
pub fn is_valid_backup_id(backup_id: &str) -> bool {
    !backup_id.is_empty()
        && backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn validate_backup_id(backup_id: &str) -> ReaderWriterResult<()> {
    if is_valid_backup_id(backup_id) {
        Ok(())
    } else {
        Err(BackupReaderWriterError::InvalidArchive(format!(
            "invalid backup id {:?}",
            backup_id
        )))
    }
}

/// Lowercase, with every run of non-alphanumerics collapsed to `_`
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug.to_string()
    }
}

/// File name for storing `backup` on remote storage
pub fn suggested_filename(backup: &AgentBackup) -> String {
    match backup.parsed_date() {
        Some(date) => suggested_filename_from_name_date(&backup.name, &date),
        None => format!("{}_{}.tar", slugify(&backup.name), backup.backup_id),
    }
}

pub fn suggested_filename_from_name_date(name: &str, date: &DateTime<FixedOffset>) -> String {
    format!(
        "{}_{}.tar",
        slugify(name),
        date.format("%Y-%m-%d_%H.%M_%S%6f")
    )
}

/// `homeassistant` object in backup.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJsonHomeAssistant {
    #[serde(default)]
    pub exclude_database: bool,
    pub version: String,
}

/// Contents of `backup.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJson {
    #[serde(default)]
    pub addons: Vec<AddonInfo>,
    #[serde(default = "default_true")]
    pub compressed: bool,
    pub date: String,
    #[serde(default)]
    pub extra: ExtraMetadata,
    /// Supervisor lists "homeassistant" among folders, so these stay strings
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub homeassistant: Option<BackupJsonHomeAssistant>,
    pub name: String,
    #[serde(default)]
    pub protected: bool,
    pub slug: String,
    #[serde(rename = "type", default = "default_type")]
    pub backup_type: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_true() -> bool {
    true
}

fn default_type() -> String {
    "partial".to_string()
}

fn default_version() -> u32 {
    2
}

impl BackupJson {
    /// Metadata for a core backup about to be written
    pub fn for_core_backup(
        backup_id: &str,
        name: &str,
        date: &str,
        include_database: bool,
        protected: bool,
        extra: ExtraMetadata,
        version: &str,
    ) -> Self {
        Self {
            addons: Vec::new(),
            compressed: true,
            date: date.to_string(),
            extra,
            folders: Vec::new(),
            homeassistant: Some(BackupJsonHomeAssistant {
                exclude_database: !include_database,
                version: version.to_string(),
            }),
            name: name.to_string(),
            protected,
            slug: backup_id.to_string(),
            backup_type: default_type(),
            version: default_version(),
        }
    }

    pub fn to_agent_backup(&self, size: u64) -> AgentBackup {
        let (homeassistant_included, homeassistant_version, database_included) =
            match &self.homeassistant {
                Some(ha) => (true, Some(ha.version.clone()), !ha.exclude_database),
                None => (false, None, true),
            };
        let folders = self
            .folders
            .iter()
            .filter(|f| f.as_str() != "homeassistant")
            .filter_map(|f| serde_json::from_value::<Folder>(f.clone().into()).ok())
            .collect();

        AgentBackup {
            addons: self.addons.clone(),
            backup_id: self.slug.clone(),
            database_included,
            date: self.date.clone(),
            extra_metadata: self.extra.clone(),
            folders,
            homeassistant_included,
            homeassistant_version,
            name: self.name.clone(),
            protected: self.protected,
            size,
        }
    }
}

fn is_member(path: &Path, name: &str) -> bool {
    path.strip_prefix(".").unwrap_or(path) == Path::new(name)
}

/// Read the metadata of the archive at `path`
///
/// Blocking; call from `spawn_blocking`.
pub fn read_backup(path: &Path) -> ReaderWriterResult<AgentBackup> {
    let size = std::fs::metadata(path)?.len();
    let mut archive = tar::Archive::new(File::open(path)?);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !is_member(&entry.path()?, BACKUP_JSON) {
            continue;
        }
        let mut raw = String::new();
        entry.read_to_string(&mut raw)?;
        let json: BackupJson = serde_json::from_str(&raw).map_err(|e| {
            BackupReaderWriterError::InvalidArchive(format!("{}: {}", BACKUP_JSON, e))
        })?;
        validate_backup_id(&json.slug)?;
        return Ok(json.to_agent_backup(size));
    }

    Err(BackupReaderWriterError::InvalidArchive(format!(
        "{} not found in {}",
        BACKUP_JSON,
        path.display()
    )))
}

/// Matches paths relative to the config directory against exclude globs
///
/// Globs match from the right, so `*.log` excludes log files at any depth.
#[derive(Debug)]
pub struct ExcludeMatcher {
    patterns: Vec<Regex>,
}

impl ExcludeMatcher {
    pub fn new<'a>(globs: impl IntoIterator<Item = &'a str>) -> io::Result<Self> {
        let patterns = globs
            .into_iter()
            .map(|glob| {
                Regex::new(&glob_to_regex(glob))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
            })
            .collect::<io::Result<_>>()?;
        Ok(Self { patterns })
    }

    pub fn for_backup(include_database: bool) -> io::Result<Self> {
        let database: &[&str] = if include_database {
            &[]
        } else {
            EXCLUDE_DATABASE_FROM_BACKUP
        };
        Self::new(EXCLUDE_FROM_BACKUP.iter().chain(database).copied())
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(relative))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::from("(^|/)");
    for c in glob.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

/// Write a complete backup archive to `tar_path` and return its size
///
/// Blocking; call from `spawn_blocking`.
pub fn write_backup_archive(
    config_dir: &Path,
    tar_path: &Path,
    backup_json: &BackupJson,
    include_database: bool,
) -> ReaderWriterResult<u64> {
    if let Some(parent) = tar_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let excludes = ExcludeMatcher::for_backup(include_database)?;

    // The inner archive goes to a temp file outside the config dir so the
    // directory walk never sees it.
    let inner = tempfile::NamedTempFile::new()?;
    {
        let encoder = GzEncoder::new(inner.as_file(), Compression::default());
        let mut core_tar = tar::Builder::new(encoder);
        core_tar.follow_symlinks(false);
        add_dir_contents(&mut core_tar, config_dir, Path::new(""), &excludes)?;
        core_tar.into_inner()?.finish()?;
    }

    let mut outer = tar::Builder::new(File::create(tar_path)?);
    let raw = serde_json::to_vec(backup_json)
        .map_err(|e| BackupReaderWriterError::InvalidArchive(e.to_string()))?;
    let mut header = tar::Header::new_gnu();
    header.set_size(raw.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    outer.append_data(&mut header, BACKUP_JSON, raw.as_slice())?;
    outer.append_path_with_name(inner.path(), HOMEASSISTANT_TAR)?;
    outer.into_inner()?.flush()?;

    let size = std::fs::metadata(tar_path)?.len();
    debug!("Wrote backup {} ({} bytes)", tar_path.display(), size);
    Ok(size)
}

fn add_dir_contents<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    relative: &Path,
    excludes: &ExcludeMatcher,
) -> io::Result<()> {
    let mut entries = std::fs::read_dir(root.join(relative))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel = relative.join(entry.file_name());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if excludes.is_excluded(&rel_str) {
            trace!("Excluding {}", rel_str);
            continue;
        }
        let archive_name = Path::new(DATA_DIR).join(&rel);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&archive_name, entry.path())?;
            add_dir_contents(builder, root, &rel, excludes)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &archive_name)?;
        }
    }
    Ok(())
}

/// Extract the `data/` tree of the archive at `tar_path` into `dest`
///
/// Blocking; call from `spawn_blocking`.
pub fn extract_data(tar_path: &Path, dest: &Path) -> ReaderWriterResult<PathBuf> {
    let mut outer = tar::Archive::new(File::open(tar_path)?);
    for entry in outer.entries()? {
        let entry = entry?;
        if !is_member(&entry.path()?, HOMEASSISTANT_TAR) {
            continue;
        }
        let mut inner = tar::Archive::new(flate2::read::GzDecoder::new(entry));
        inner.unpack(dest)?;
        return Ok(dest.join(DATA_DIR));
    }
    Err(BackupReaderWriterError::InvalidArchive(format!(
        "{} not found in {}",
        HOMEASSISTANT_TAR,
        tar_path.display()
    )))
}

/// Lazily read a file in [`BUF_SIZE`] chunks
pub async fn file_stream(path: impl AsRef<Path>) -> io::Result<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(BUF_SIZE);
        let read = file.read_buf(&mut buf).await?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    });
    Ok(stream.boxed())
}

/// Drain `stream` into `path` via a `.part` file; returns bytes written
pub async fn write_stream(mut stream: ByteStream, path: &Path) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = path.with_extension("part");
    let mut file = tokio::fs::File::create(&part).await?;
    let mut written = 0u64;

    let result = async {
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(err);
    }
    tokio::fs::rename(&part, path).await?;
    Ok(written)
}
