//! Minimal object storage contract
//!
//! Modelled on S3-style APIs: flat keys, paginated listing and multipart
//! uploads that must be completed or aborted.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use ha_backup::ByteStream;

use crate::error::ObjectStoreResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Pass back to `list` for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Receipt for an uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, key: &str, data: Bytes) -> ObjectStoreResult<()>;

    /// Stream an object; `NotFound` when absent
    async fn get(&self, key: &str) -> ObjectStoreResult<ByteStream>;

    /// Remove an object, returning whether it existed
    async fn delete(&self, key: &str) -> ObjectStoreResult<bool>;

    /// Keys starting with `prefix`, in key order
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage>;

    /// Start a multipart upload, returning its upload id
    async fn create_multipart(&self, key: &str) -> ObjectStoreResult<String>;

    /// Upload one part; part numbers start at 1
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ObjectStoreResult<CompletedPart>;

    /// Assemble `parts` in order into `key`
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectStoreResult<()>;

    /// Discard an unfinished upload and its parts
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ObjectStoreResult<()>;
}

/// Read a whole (small) object into memory
pub async fn get_bytes<S: ObjectStore + ?Sized>(store: &S, key: &str) -> ObjectStoreResult<Bytes> {
    let mut stream = store.get(key).await?;
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
