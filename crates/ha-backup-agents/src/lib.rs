//! Remote Backup Agents
//!
//! Agents storing backups in object storage. One generic agent,
//! [`ObjectStorageBackupAgent`], works over any [`ObjectStore`]; the stores
//! here are a directory (typically a mounted NAS share) and memory.
//!
//! Agents are built from the `backup.agents` entries of
//! `configuration.yaml`:
//!
//! ```yaml
//! backup:
//!   agents:
//!     - domain: nas
//!       entry_id: attic
//!       path: /mnt/nas/ha-backups
//!       prefix: homeassistant
//!       page_size: 500
//! ```

mod agent;
mod error;
mod fs;
mod memory;
mod object_store;

use std::sync::Arc;

use ha_backup::BackupAgent;
use ha_config::AgentEntryConfig;
use tracing::{info, warn};

pub use agent::{
    BackupMetadataFile, ObjectStorageBackupAgent, CACHE_TTL, METADATA_SUFFIX, METADATA_VERSION,
    MULTIPART_MIN_PART_SIZE, MULTIPART_THRESHOLD,
};
pub use error::{ObjectStoreError, ObjectStoreResult};
pub use fs::FsObjectStore;
pub use memory::InMemoryObjectStore;
pub use object_store::{get_bytes, CompletedPart, ListPage, ObjectMeta, ObjectStore};

/// Directory-backed agents
pub const DOMAIN_NAS: &str = "nas";
/// Volatile agents
pub const DOMAIN_MEMORY: &str = "memory";

/// Build one agent per configured entry
///
/// Entries of unknown domains are skipped with a warning. NAS directories
/// are created when missing.
pub async fn async_get_backup_agents(
    entries: &[AgentEntryConfig],
) -> ObjectStoreResult<Vec<Arc<dyn BackupAgent>>> {
    let mut agents: Vec<Arc<dyn BackupAgent>> = Vec::new();
    for entry in entries {
        let prefix = entry.option_str("prefix").unwrap_or_default();
        match entry.domain.as_str() {
            DOMAIN_NAS => {
                let store = Arc::new(nas_store(entry).await?);
                agents.push(Arc::new(
                    ObjectStorageBackupAgent::new(
                        DOMAIN_NAS,
                        &entry.entry_id,
                        entry.display_name(),
                        store,
                    )
                    .with_prefix(prefix),
                ));
            }
            DOMAIN_MEMORY => {
                agents.push(Arc::new(
                    ObjectStorageBackupAgent::new(
                        DOMAIN_MEMORY,
                        &entry.entry_id,
                        entry.display_name(),
                        Arc::new(InMemoryObjectStore::new()),
                    )
                    .with_prefix(prefix),
                ));
            }
            other => {
                warn!(
                    "Unknown backup agent domain '{}' for entry {}, skipping",
                    other, entry.entry_id
                );
                continue;
            }
        }
        info!("Set up backup agent {}.{}", entry.domain, entry.entry_id);
    }
    Ok(agents)
}

/// Directory store for a `nas` entry, honoring `path` and `page_size`
async fn nas_store(entry: &AgentEntryConfig) -> ObjectStoreResult<FsObjectStore> {
    let path = entry.option_str("path").ok_or_else(|| {
        ObjectStoreError::InvalidConfig(format!(
            "{}.{}: missing 'path'",
            entry.domain, entry.entry_id
        ))
    })?;
    tokio::fs::create_dir_all(path).await?;
    let page_size = entry
        .option_u64("page_size")
        .map_or(fs::DEFAULT_PAGE_SIZE, |n| n as usize);
    Ok(FsObjectStore::new(path).with_page_size(page_size))
}
