//! Backup agent over any [`ObjectStore`]
//!
//! Each backup is two objects: the tar archive and a `.metadata.json`
//! side-car describing it. Listing only reads side-cars, so the archive is
//! never touched to enumerate backups.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use futures::TryStreamExt;
use ha_backup::archive::{is_valid_backup_id, suggested_filename};
use ha_backup::{AgentBackup, AgentResult, BackupAgent, BackupAgentError, ByteStream, OpenStream};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ObjectStoreError, ObjectStoreResult};
use crate::object_store::{get_bytes, CompletedPart, ObjectStore};

/// How long a listing is reused
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Archives at least this large go through a multipart upload
pub const MULTIPART_THRESHOLD: u64 = 20 * 1024 * 1024;

/// Smallest part object stores accept, except for the last one
pub const MULTIPART_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub const METADATA_VERSION: &str = "1";
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Side-car stored next to each archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadataFile {
    pub metadata_version: String,
    pub backup_id: String,
    pub backup_metadata: AgentBackup,
}

/// Object keys of one backup
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackupKeys {
    archive: String,
    metadata: String,
}

impl BackupKeys {
    fn for_backup(prefix: &str, backup: &AgentBackup) -> Self {
        let archive = format!("{}{}", prefix, suggested_filename(backup));
        let stem = archive.strip_suffix(".tar").unwrap_or(&archive);
        Self {
            metadata: format!("{}{}", stem, METADATA_SUFFIX),
            archive,
        }
    }

    fn from_metadata_key(metadata: &str) -> Self {
        let stem = metadata.strip_suffix(METADATA_SUFFIX).unwrap_or(metadata);
        Self {
            archive: format!("{}.tar", stem),
            metadata: metadata.to_string(),
        }
    }
}

struct Listing {
    backups: BTreeMap<String, (AgentBackup, BackupKeys)>,
    expires_at: Instant,
}

pub struct ObjectStorageBackupAgent<S> {
    domain: String,
    unique_id: String,
    name: String,
    prefix: String,
    store: Arc<S>,
    cache: Mutex<Option<Listing>>,
}

impl<S: ObjectStore> ObjectStorageBackupAgent<S> {
    pub fn new(
        domain: impl Into<String>,
        unique_id: impl Into<String>,
        name: impl Into<String>,
        store: Arc<S>,
    ) -> Self {
        Self {
            domain: domain.into(),
            unique_id: unique_id.into(),
            name: name.into(),
            prefix: String::new(),
            store,
            cache: Mutex::new(None),
        }
    }

    /// Keep objects under `prefix`, e.g. `homeassistant/`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.prefix = prefix;
        self
    }

    async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Cached `backup_id -> (backup, keys)` map, refreshed after [`CACHE_TTL`]
    async fn listing(&self) -> ObjectStoreResult<BTreeMap<String, (AgentBackup, BackupKeys)>> {
        let mut cache = self.cache.lock().await;
        if let Some(listing) = cache.as_ref() {
            if Instant::now() < listing.expires_at {
                return Ok(listing.backups.clone());
            }
        }

        let backups = self.fetch_listing().await?;
        *cache = Some(Listing {
            backups: backups.clone(),
            expires_at: Instant::now() + CACHE_TTL,
        });
        Ok(backups)
    }

    async fn fetch_listing(&self) -> ObjectStoreResult<BTreeMap<String, (AgentBackup, BackupKeys)>> {
        let mut backups = BTreeMap::new();
        let mut token = None;
        loop {
            let page = self.store.list(&self.prefix, token).await?;
            let metadata_keys: Vec<&str> = page
                .objects
                .iter()
                .map(|meta| meta.key.as_str())
                .filter(|key| key.ends_with(METADATA_SUFFIX))
                .collect();

            let files = join_all(metadata_keys.iter().map(|key| self.read_metadata(key))).await;
            for (key, file) in metadata_keys.iter().zip(files) {
                match file {
                    Ok(file)
                        if !is_valid_backup_id(&file.backup_id)
                            || file.backup_metadata.backup_id != file.backup_id =>
                    {
                        warn!("Skipping backup metadata {} with invalid backup id", key);
                    }
                    Ok(file) => {
                        backups.insert(
                            file.backup_id,
                            (file.backup_metadata, BackupKeys::from_metadata_key(key)),
                        );
                    }
                    Err(err) => warn!("Skipping invalid backup metadata {}: {}", key, err),
                }
            }

            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        debug!("Listed {} backups on {}", backups.len(), self.agent_id());
        Ok(backups)
    }

    async fn read_metadata(&self, key: &str) -> ObjectStoreResult<BackupMetadataFile> {
        let raw = get_bytes(self.store.as_ref(), key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn put_archive(&self, key: &str, open_stream: OpenStream) -> ObjectStoreResult<()> {
        let mut stream = open_stream().await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        self.store.put(key, buf.freeze()).await
    }

    /// Multipart upload; aborted on any failure so no parts are orphaned
    async fn put_archive_multipart(
        &self,
        key: &str,
        open_stream: OpenStream,
    ) -> ObjectStoreResult<()> {
        let upload_id = self.store.create_multipart(key).await?;
        let result = async {
            let parts = self.upload_parts(key, &upload_id, open_stream).await?;
            self.store.complete_multipart(key, &upload_id, parts).await
        }
        .await;

        if let Err(err) = &result {
            warn!("Multipart upload of {} failed, aborting: {}", key, err);
            if let Err(abort_err) = self.store.abort_multipart(key, &upload_id).await {
                warn!("Aborting multipart upload {} failed: {}", upload_id, abort_err);
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        open_stream: OpenStream,
    ) -> ObjectStoreResult<Vec<CompletedPart>> {
        let mut stream = open_stream().await?;
        let mut parts = Vec::new();
        let mut buf = BytesMut::with_capacity(MULTIPART_MIN_PART_SIZE);

        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
            if buf.len() >= MULTIPART_MIN_PART_SIZE {
                let part_number = parts.len() as u32 + 1;
                let data: Bytes = buf.split().freeze();
                parts.push(
                    self.store
                        .upload_part(key, upload_id, part_number, data)
                        .await?,
                );
            }
        }
        if !buf.is_empty() || parts.is_empty() {
            let part_number = parts.len() as u32 + 1;
            parts.push(
                self.store
                    .upload_part(key, upload_id, part_number, buf.freeze())
                    .await?,
            );
        }
        Ok(parts)
    }

    async fn upload(&self, open_stream: OpenStream, backup: &AgentBackup) -> ObjectStoreResult<()> {
        let keys = BackupKeys::for_backup(&self.prefix, backup);
        if backup.size < MULTIPART_THRESHOLD {
            self.put_archive(&keys.archive, open_stream).await?;
        } else {
            self.put_archive_multipart(&keys.archive, open_stream).await?;
        }

        // Written last so a listed backup always has its archive
        let metadata = BackupMetadataFile {
            metadata_version: METADATA_VERSION.to_string(),
            backup_id: backup.backup_id.clone(),
            backup_metadata: backup.clone(),
        };
        self.store
            .put(&keys.metadata, Bytes::from(serde_json::to_vec(&metadata)?))
            .await
    }
}

#[async_trait]
impl<S: ObjectStore> BackupAgent for ObjectStorageBackupAgent<S> {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn list_backups(&self) -> AgentResult<Vec<AgentBackup>> {
        Ok(self
            .listing()
            .await?
            .into_values()
            .map(|(backup, _)| backup)
            .collect())
    }

    async fn get_backup(&self, backup_id: &str) -> AgentResult<Option<AgentBackup>> {
        Ok(self
            .listing()
            .await?
            .remove(backup_id)
            .map(|(backup, _)| backup))
    }

    async fn upload_backup(&self, open_stream: OpenStream, backup: &AgentBackup) -> AgentResult<()> {
        let result = self.upload(open_stream, backup).await;
        self.invalidate_cache().await;
        result?;
        debug!("Uploaded backup {} to {}", backup.backup_id, self.agent_id());
        Ok(())
    }

    async fn download_backup(&self, backup_id: &str) -> AgentResult<ByteStream> {
        let (_, keys) = self
            .listing()
            .await?
            .remove(backup_id)
            .ok_or_else(|| BackupAgentError::NotFound(backup_id.to_string()))?;
        match self.store.get(&keys.archive).await {
            Ok(stream) => Ok(stream),
            Err(ObjectStoreError::NotFound(_)) => {
                self.invalidate_cache().await;
                Err(BackupAgentError::NotFound(backup_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_backup(&self, backup_id: &str) -> AgentResult<()> {
        let Some((_, keys)) = self.listing().await?.remove(backup_id) else {
            return Ok(());
        };
        let result = async {
            self.store.delete(&keys.archive).await?;
            self.store.delete(&keys.metadata).await?;
            Ok::<_, ObjectStoreError>(())
        }
        .await;
        self.invalidate_cache().await;
        result?;
        debug!("Deleted backup {} from {}", backup_id, self.agent_id());
        Ok(())
    }
}
