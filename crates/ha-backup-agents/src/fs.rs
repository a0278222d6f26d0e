//! Directory-backed object store, e.g. a mounted NAS share
//!
//! Keys map to relative paths below the root. Multipart parts are staged in
//! `<root>/.multipart/<upload_id>/` until completed.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use ha_backup::archive::file_stream;
use ha_backup::ByteStream;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ObjectStoreError, ObjectStoreResult};
use crate::object_store::{CompletedPart, ListPage, ObjectMeta, ObjectStore};

const MULTIPART_DIR: &str = ".multipart";
const UPLOAD_KEY_FILE: &str = "key";
const TEMP_SUFFIX: &str = ".tmp";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub struct FsObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn object_path(&self, key: &str) -> ObjectStoreResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.starts_with(MULTIPART_DIR)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    /// Staging dir of `upload_id`, checking it belongs to `key`
    async fn checked_upload_dir(&self, key: &str, upload_id: &str) -> ObjectStoreResult<PathBuf> {
        let dir = self.upload_dir(upload_id);
        let unknown = || ObjectStoreError::UnknownUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        };
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            return Err(unknown());
        }
        match fs::read_to_string(dir.join(UPLOAD_KEY_FILE)).await {
            Ok(stored) if stored == key => Ok(dir),
            Ok(_) => Err(unknown()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(unknown()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> ObjectStoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = temp_path(path);
        fs::write(&temp, data).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn part_file(part_number: u32) -> String {
    format!("part-{:05}", part_number)
}

/// All object keys below `root`, sorted
fn walk_keys(root: &Path) -> std::io::Result<Vec<ObjectMeta>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectMeta>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if dir == root && entry.file_name() == MULTIPART_DIR {
                    continue;
                }
                walk(root, &path, out)?;
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                out.push(ObjectMeta {
                    key,
                    size: entry.metadata()?.len(),
                });
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> ObjectStoreResult<()> {
        let path = self.object_path(key)?;
        self.write_atomic(&path, &data).await
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<ByteStream> {
        let path = self.object_path(key)?;
        file_stream(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ObjectStoreError::NotFound(key.to_string()),
            _ => e.into(),
        })
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<bool> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage> {
        let root = self.root.clone();
        let all = tokio::task::spawn_blocking(move || walk_keys(&root))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        let mut matching = all
            .into_iter()
            .filter(|meta| meta.key.starts_with(prefix))
            .filter(|meta| {
                continuation_token
                    .as_ref()
                    .map_or(true, |token| meta.key.as_str() > token.as_str())
            });
        let page: Vec<ObjectMeta> = matching.by_ref().take(self.page_size).collect();
        let next_token = match matching.next() {
            Some(_) => page.last().map(|meta| meta.key.clone()),
            None => None,
        };
        Ok(ListPage {
            objects: page,
            next_token,
        })
    }

    async fn create_multipart(&self, key: &str) -> ObjectStoreResult<String> {
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(UPLOAD_KEY_FILE), key).await?;
        debug!("Started multipart upload {} for {}", upload_id, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ObjectStoreResult<CompletedPart> {
        let dir = self.checked_upload_dir(key, upload_id).await?;
        let etag = format!("{}-{}", part_number, data.len());
        fs::write(dir.join(part_file(part_number)), &data).await?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectStoreResult<()> {
        let dir = self.checked_upload_dir(key, upload_id).await?;
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = temp_path(&path);
        let mut out = fs::File::create(&temp).await?;
        let assembled = async {
            for part in &parts {
                let mut stream = file_stream(dir.join(part_file(part.part_number))).await?;
                while let Some(chunk) = stream.try_next().await? {
                    out.write_all(&chunk).await?;
                }
            }
            out.flush().await?;
            out.sync_all().await
        }
        .await;
        if let Err(e) = assembled {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        fs::rename(&temp, &path).await?;
        fs::remove_dir_all(&dir).await?;
        debug!("Completed multipart upload {} for {}", upload_id, key);
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ObjectStoreResult<()> {
        let dir = self.checked_upload_dir(key, upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        debug!("Aborted multipart upload {} for {}", upload_id, key);
        Ok(())
    }
}
