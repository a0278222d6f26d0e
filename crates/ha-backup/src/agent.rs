//! Backup agent contract
//!
//! An agent is one storage backend. The manager only ever talks to agents
//! through [`BackupAgent`] and only ever sees [`BackupAgentError`] back.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;

use crate::error::{AgentResult, BackupAgentError};
use crate::models::AgentBackup;

/// Lazy, finite stream of archive bytes
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Re-openable stream producer
///
/// Uploads to several agents each open their own stream from the same
/// source, and an agent may reopen it to retry.
pub type OpenStream = Arc<dyn Fn() -> BoxFuture<'static, io::Result<ByteStream>> + Send + Sync>;

/// Wrap an async closure as an [`OpenStream`]
pub fn open_stream_fn<F, Fut>(f: F) -> OpenStream
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<ByteStream>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[async_trait]
pub trait BackupAgent: Send + Sync {
    /// Integration domain, e.g. `backup` or `nas`
    fn domain(&self) -> &str;

    /// Config entry id, unique within the domain
    fn unique_id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    fn agent_id(&self) -> String {
        format!("{}.{}", self.domain(), self.unique_id())
    }

    async fn list_backups(&self) -> AgentResult<Vec<AgentBackup>>;

    /// Look up one backup; `Ok(None)` when this agent doesn't hold it
    async fn get_backup(&self, backup_id: &str) -> AgentResult<Option<AgentBackup>> {
        Ok(self
            .list_backups()
            .await?
            .into_iter()
            .find(|backup| backup.backup_id == backup_id))
    }

    /// Store the archive produced by `open_stream` together with its metadata
    async fn upload_backup(&self, open_stream: OpenStream, backup: &AgentBackup)
        -> AgentResult<()>;

    /// Stream an archive; [`BackupAgentError::NotFound`] for unknown ids
    async fn download_backup(&self, backup_id: &str) -> AgentResult<ByteStream>;

    /// Remove archive and metadata; deleting an absent backup succeeds
    async fn delete_backup(&self, backup_id: &str) -> AgentResult<()>;
}

/// Agent storing archives on the local filesystem
///
/// The reader/writer writes new archives straight to
/// [`backup_path`](LocalBackupAgent::backup_path) so uploading to a local
/// agent doesn't copy the file.
pub trait LocalBackupAgent: BackupAgent {
    /// Path of the archive for `backup_id`, whether or not it exists yet
    fn backup_path(&self, backup_id: &str) -> PathBuf;
}

pub(crate) fn not_found(backup_id: &str) -> BackupAgentError {
    BackupAgentError::NotFound(backup_id.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted in-memory agent for manager tests

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::{stream, StreamExt, TryStreamExt};
    use tokio::sync::Mutex;

    use super::*;

    pub struct MockAgent {
        domain: String,
        unique_id: String,
        pub backups: Mutex<BTreeMap<String, (AgentBackup, Vec<u8>)>>,
        pub fail_with: Option<BackupAgentError>,
        pub delay: Option<Duration>,
        pub list_calls: AtomicUsize,
    }

    impl MockAgent {
        pub fn new(domain: &str, unique_id: &str) -> Self {
            Self {
                domain: domain.to_string(),
                unique_id: unique_id.to_string(),
                backups: Mutex::new(BTreeMap::new()),
                fail_with: None,
                delay: None,
                list_calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(domain: &str, unique_id: &str, error: BackupAgentError) -> Self {
            Self {
                fail_with: Some(error),
                ..Self::new(domain, unique_id)
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub async fn with_backup(self, backup: AgentBackup) -> Self {
            self.backups
                .lock()
                .await
                .insert(backup.backup_id.clone(), (backup, b"test".to_vec()));
            self
        }

        async fn check(&self) -> AgentResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl BackupAgent for MockAgent {
        fn domain(&self) -> &str {
            &self.domain
        }

        fn unique_id(&self) -> &str {
            &self.unique_id
        }

        fn name(&self) -> &str {
            &self.unique_id
        }

        async fn list_backups(&self) -> AgentResult<Vec<AgentBackup>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.check().await?;
            Ok(self
                .backups
                .lock()
                .await
                .values()
                .map(|(b, _)| b.clone())
                .collect())
        }

        async fn upload_backup(
            &self,
            open_stream: OpenStream,
            backup: &AgentBackup,
        ) -> AgentResult<()> {
            self.check().await?;
            let chunks: Vec<Bytes> = open_stream().await?.try_collect().await?;
            let data = chunks.concat();
            self.backups
                .lock()
                .await
                .insert(backup.backup_id.clone(), (backup.clone(), data));
            Ok(())
        }

        async fn download_backup(&self, backup_id: &str) -> AgentResult<ByteStream> {
            self.check().await?;
            let backups = self.backups.lock().await;
            let (_, data) = backups.get(backup_id).ok_or_else(|| not_found(backup_id))?;
            let chunk = Bytes::from(data.clone());
            Ok(stream::iter(vec![Ok(chunk)]).boxed())
        }

        async fn delete_backup(&self, backup_id: &str) -> AgentResult<()> {
            self.check().await?;
            self.backups.lock().await.remove(backup_id);
            Ok(())
        }
    }

    pub fn bytes_stream(data: &'static [u8]) -> OpenStream {
        open_stream_fn(move || async move {
            let s: ByteStream = stream::iter(vec![Ok(Bytes::from_static(data))]).boxed();
            Ok(s)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::test_support::agent_backup;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_agent_id_and_default_get_backup() {
        let agent = MockAgent::new("nas", "attic")
            .with_backup(agent_backup("abc123", "2025-01-01T00:00:00+00:00", false))
            .await;

        assert_eq!(agent.agent_id(), "nas.attic");
        assert!(agent.get_backup("abc123").await.unwrap().is_some());
        assert!(agent.get_backup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_stream_can_be_reopened() {
        let open = bytes_stream(b"payload");
        for _ in 0..2 {
            let chunks: Vec<Bytes> = open().await.unwrap().try_collect().await.unwrap();
            assert_eq!(chunks.concat(), b"payload");
        }
    }
}
