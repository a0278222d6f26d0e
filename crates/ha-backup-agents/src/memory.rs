//! In-memory object store

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use ha_backup::ByteStream;
use tokio::sync::Mutex;

use crate::error::{ObjectStoreError, ObjectStoreResult};
use crate::object_store::{CompletedPart, ListPage, ObjectMeta, ObjectStore};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

/// Volatile store, mostly useful as a scratch agent and in tests
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    /// Multipart uploads neither completed nor aborted
    pub async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> ObjectStoreResult<()> {
        self.objects.lock().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<ByteStream> {
        let data = self
            .objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(stream::iter(vec![Ok(data)]).boxed())
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<bool> {
        Ok(self.objects.lock().await.remove(key).is_some())
    }

    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage> {
        let objects = self.objects.lock().await;
        let start = match &continuation_token {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut matching = objects
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectMeta {
                key: key.clone(),
                size: data.len() as u64,
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
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        self.uploads.lock().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ObjectStoreResult<CompletedPart> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| unknown_upload(key, upload_id))?;
        let etag = format!("{}-{}", part_number, data.len());
        upload.parts.insert(part_number, data);
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectStoreResult<()> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| unknown_upload(key, upload_id))?;

        let mut data = BytesMut::new();
        for part in &parts {
            let chunk = upload.parts.get(&part.part_number).ok_or_else(|| {
                ObjectStoreError::InvalidKey(format!("{} part {}", key, part.part_number))
            })?;
            data.extend_from_slice(chunk);
        }
        uploads.remove(upload_id);
        drop(uploads);

        self.objects
            .lock()
            .await
            .insert(key.to_string(), data.freeze());
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ObjectStoreResult<()> {
        let mut uploads = self.uploads.lock().await;
        match uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(unknown_upload(key, upload_id)),
        }
    }
}

fn unknown_upload(key: &str, upload_id: &str) -> ObjectStoreError {
    ObjectStoreError::UnknownUpload {
        key: key.to_string(),
        upload_id: upload_id.to_string(),
    }
}
