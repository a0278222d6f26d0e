//! Backup manager
//!
//! Fans every operation out to the registered agents concurrently. A
//! failing agent is recorded in the returned [`AgentErrors`] and never stops
//! the others, so partial success is the normal outcome.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{open_stream_fn, BackupAgent, ByteStream, LocalBackupAgent, OpenStream};
use crate::config::{backups_to_delete, BackupConfigData, BackupConfigUpdate, CreateBackupParams};
use crate::constants::HA_VERSION;
use crate::error::{
    BackupAgentError, BackupManagerError, BackupReaderWriterError, ManagerResult,
};
use crate::events::{
    CreateBackupStage, ManagerStateEvent, OperationState, ReceiveBackupStage,
};
use crate::models::{
    AgentBackup, BackupAgentInfo, ExtraMetadata, Folder, ManagerBackup, EXTRA_INSTANCE_ID,
    EXTRA_WITH_AUTOMATIC_SETTINGS,
};
use crate::reader_writer::{
    BackupPlatform, BackupReaderWriter, BackupTask, CreateBackupArgs, NewBackup,
    ReceiveBackupArgs, RestoreBackupArgs,
};
use crate::store::{BackupStore, StoredBackupData};

/// Per-agent failures of one fan-out, keyed by agent id
pub type AgentErrors = BTreeMap<String, BackupAgentError>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Reason attached to a failed create event when agents rejected the upload
pub const REASON_UPLOAD_FAILED: &str = "upload_failed";
/// Reason attached to a failed create event when generation failed
pub const REASON_UNKNOWN_ERROR: &str = "unknown_error";

/// Options for a restore
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestoreBackupParams {
    pub agent_id: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub restore_addons: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub restore_database: bool,
    #[serde(default)]
    pub restore_folders: Option<Vec<Folder>>,
    #[serde(default = "default_true")]
    pub restore_homeassistant: bool,
}

fn default_true() -> bool {
    true
}

pub struct BackupManager {
    agents: RwLock<IndexMap<String, Arc<dyn BackupAgent>>>,
    local_agents: RwLock<IndexMap<String, Arc<dyn LocalBackupAgent>>>,
    platforms: RwLock<Vec<Arc<dyn BackupPlatform>>>,
    reader_writer: Arc<dyn BackupReaderWriter>,
    store: BackupStore,
    data: tokio::sync::Mutex<StoredBackupData>,
    instance_id: OnceLock<String>,
    last_event: Mutex<ManagerStateEvent>,
    events: broadcast::Sender<ManagerStateEvent>,
    finish_task: Mutex<Option<JoinHandle<()>>>,
    config_changed: Notify,
}

impl BackupManager {
    pub fn new(reader_writer: Arc<dyn BackupReaderWriter>, store: BackupStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agents: RwLock::new(IndexMap::new()),
            local_agents: RwLock::new(IndexMap::new()),
            platforms: RwLock::new(Vec::new()),
            reader_writer,
            store,
            data: tokio::sync::Mutex::new(StoredBackupData::default()),
            instance_id: OnceLock::new(),
            last_event: Mutex::new(ManagerStateEvent::Idle),
            events,
            finish_task: Mutex::new(None),
            config_changed: Notify::new(),
        }
    }

    /// Load persisted settings and the instance id
    pub async fn load(&self) -> ManagerResult<()> {
        if let Some(data) = self.store.load().await? {
            info!(
                "Loaded backup settings, {} backups with failed uploads",
                data.backups.len()
            );
            *self.data.lock().await = data;
        }
        let instance_id = self.store.instance_id().await?;
        let _ = self.instance_id.set(instance_id);
        Ok(())
    }

    // Agents

    pub async fn add_agents(&self, agents: impl IntoIterator<Item = Arc<dyn BackupAgent>>) {
        let mut map = self.agents.write().await;
        for agent in agents {
            let agent_id = agent.agent_id();
            debug!("Adding backup agent {}", agent_id);
            map.insert(agent_id, agent);
        }
    }

    /// Register an agent that can also be written to directly
    pub async fn add_local_agent<A: LocalBackupAgent + 'static>(&self, agent: Arc<A>) {
        let agent_id = agent.agent_id();
        self.local_agents
            .write()
            .await
            .insert(agent_id.clone(), agent.clone());
        self.agents.write().await.insert(agent_id.clone(), agent);
        debug!("Adding local backup agent {}", agent_id);
    }

    /// Drop every agent of `domain`, e.g. when its config entry unloads
    pub async fn remove_agents(&self, domain: &str) {
        let prefix = format!("{}.", domain);
        self.agents
            .write()
            .await
            .retain(|agent_id, _| !agent_id.starts_with(&prefix));
        self.local_agents
            .write()
            .await
            .retain(|agent_id, _| !agent_id.starts_with(&prefix));
    }

    pub async fn add_platform(&self, platform: Arc<dyn BackupPlatform>) {
        self.platforms.write().await.push(platform);
    }

    pub async fn agent_infos(&self) -> Vec<BackupAgentInfo> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(agent_id, agent)| BackupAgentInfo {
                agent_id: agent_id.clone(),
                name: agent.name().to_string(),
            })
            .collect()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<Arc<dyn BackupAgent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn agents_snapshot(&self) -> Vec<(String, Arc<dyn BackupAgent>)> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(id, agent)| (id.clone(), agent.clone()))
            .collect()
    }

    /// Resolve `agent_ids`, failing on any unknown id
    async fn select_agents(
        &self,
        agent_ids: &[String],
    ) -> ManagerResult<Vec<(String, Arc<dyn BackupAgent>)>> {
        let agents = self.agents.read().await;
        let unknown: Vec<String> = agent_ids
            .iter()
            .filter(|id| !agents.contains_key(id.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(BackupManagerError::InvalidAgents(unknown));
        }
        Ok(agent_ids
            .iter()
            .filter_map(|id| agents.get(id).map(|agent| (id.clone(), agent.clone())))
            .collect())
    }

    async fn local_agent_for(&self, agent_ids: &[String]) -> Option<Arc<dyn LocalBackupAgent>> {
        let local_agents = self.local_agents.read().await;
        agent_ids.iter().find_map(|id| local_agents.get(id).cloned())
    }

    // Fan-out

    /// Union of every agent's backups keyed by backup id
    pub async fn get_backups(&self) -> (BTreeMap<String, ManagerBackup>, AgentErrors) {
        let agents = self.agents_snapshot().await;
        let results = join_all(agents.iter().map(|(_, agent)| agent.list_backups())).await;

        let mut backups: BTreeMap<String, ManagerBackup> = BTreeMap::new();
        let mut agent_errors = AgentErrors::new();
        for ((agent_id, _), result) in agents.iter().zip(results) {
            match result {
                Ok(agent_backups) => {
                    for backup in agent_backups {
                        backups
                            .entry(backup.backup_id.clone())
                            .or_insert_with(|| ManagerBackup::from_agent_backup(&backup))
                            .add_agent(agent_id, &backup);
                    }
                }
                Err(err) => {
                    warn!("Listing backups on {} failed: {}", agent_id, err);
                    agent_errors.insert(agent_id.clone(), err);
                }
            }
        }

        let data = self.data.lock().await;
        for backup in backups.values_mut() {
            backup.failed_agent_ids = data.failed_agent_ids(&backup.backup_id).to_vec();
        }
        (backups, agent_errors)
    }

    pub async fn get_backup(&self, backup_id: &str) -> (Option<ManagerBackup>, AgentErrors) {
        let agents = self.agents_snapshot().await;
        let results = join_all(agents.iter().map(|(_, agent)| agent.get_backup(backup_id))).await;

        let mut found: Option<ManagerBackup> = None;
        let mut agent_errors = AgentErrors::new();
        for ((agent_id, _), result) in agents.iter().zip(results) {
            match result {
                Ok(Some(backup)) => found
                    .get_or_insert_with(|| ManagerBackup::from_agent_backup(&backup))
                    .add_agent(agent_id, &backup),
                Ok(None) => {}
                Err(err) => {
                    warn!("Getting backup {} from {} failed: {}", backup_id, agent_id, err);
                    agent_errors.insert(agent_id.clone(), err);
                }
            }
        }

        if let Some(backup) = found.as_mut() {
            let data = self.data.lock().await;
            backup.failed_agent_ids = data.failed_agent_ids(backup_id).to_vec();
        }
        (found, agent_errors)
    }

    /// Delete from `agent_ids`, or from every agent when `None`
    pub async fn delete_backup(
        &self,
        backup_id: &str,
        agent_ids: Option<&[String]>,
    ) -> ManagerResult<AgentErrors> {
        let agents = match agent_ids {
            Some(ids) => self.select_agents(ids).await?,
            None => self.agents_snapshot().await,
        };
        let results =
            join_all(agents.iter().map(|(_, agent)| agent.delete_backup(backup_id))).await;

        let mut agent_errors = AgentErrors::new();
        for ((agent_id, _), result) in agents.iter().zip(results) {
            match result {
                Ok(()) | Err(BackupAgentError::NotFound(_)) => {}
                Err(err) => {
                    warn!("Deleting backup {} from {} failed: {}", backup_id, agent_id, err);
                    agent_errors.insert(agent_id.clone(), err);
                }
            }
        }

        if agent_ids.is_none() && agent_errors.is_empty() {
            self.record_failed_agents(backup_id, Vec::new()).await;
        }
        Ok(agent_errors)
    }

    /// Upload one archive to `agent_ids` and remember which agents failed
    pub async fn upload_backup(
        &self,
        backup: &AgentBackup,
        agent_ids: &[String],
        open_stream: OpenStream,
    ) -> ManagerResult<AgentErrors> {
        let agents = self.select_agents(agent_ids).await?;
        debug!("Uploading backup {} to agents {:?}", backup.backup_id, agent_ids);

        let results = join_all(
            agents
                .iter()
                .map(|(_, agent)| agent.upload_backup(open_stream.clone(), backup)),
        )
        .await;

        let mut agent_errors = AgentErrors::new();
        for ((agent_id, _), result) in agents.iter().zip(results) {
            if let Err(err) = result {
                error!("Uploading backup {} to {} failed: {}", backup.backup_id, agent_id, err);
                agent_errors.insert(agent_id.clone(), err);
            }
        }

        self.record_failed_agents(&backup.backup_id, agent_errors.keys().cloned().collect())
            .await;
        Ok(agent_errors)
    }

    async fn record_failed_agents(&self, backup_id: &str, failed_agent_ids: Vec<String>) {
        let mut data = self.data.lock().await;
        let unchanged = data.failed_agent_ids(backup_id) == failed_agent_ids.as_slice();
        if unchanged {
            return;
        }
        data.set_failed_agent_ids(backup_id, failed_agent_ids);
        if let Err(err) = self.store.save(&data).await {
            error!("Saving backup store failed: {}", err);
        }
    }

    // State machine

    pub fn last_event(&self) -> ManagerStateEvent {
        self.last_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerStateEvent> {
        self.events.subscribe()
    }

    fn on_event(&self, event: ManagerStateEvent) {
        *self.last_event.lock().unwrap_or_else(PoisonError::into_inner) = event.clone();
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Move from idle to `event`'s state, atomically
    fn try_begin(&self, event: ManagerStateEvent) -> ManagerResult<()> {
        {
            let mut last = self.last_event.lock().unwrap_or_else(PoisonError::into_inner);
            if *last != ManagerStateEvent::Idle {
                return Err(BackupManagerError::Busy(last.manager_state()));
            }
            *last = event.clone();
        }
        let _ = self.events.send(event);
        Ok(())
    }

    /// Wait for a running create job to finish
    pub async fn join_backup_task(&self) {
        let handle = self
            .finish_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("Backup task failed: {}", err);
            }
        }
    }

    // Create

    /// Start generating a backup; the archive is written and uploaded in
    /// the background
    pub async fn create_backup(
        self: &Arc<Self>,
        params: CreateBackupParams,
        include_homeassistant: bool,
        with_automatic_settings: bool,
    ) -> ManagerResult<NewBackup> {
        self.try_begin(ManagerStateEvent::create(None, OperationState::InProgress))?;
        match self
            .start_create(params, include_homeassistant, with_automatic_settings)
            .await
        {
            Ok(new_backup) => Ok(new_backup),
            Err(err) => {
                self.on_event(ManagerStateEvent::create(None, OperationState::Failed));
                self.on_event(ManagerStateEvent::Idle);
                Err(err)
            }
        }
    }

    async fn start_create(
        self: &Arc<Self>,
        params: CreateBackupParams,
        include_homeassistant: bool,
        with_automatic_settings: bool,
    ) -> ManagerResult<NewBackup> {
        if params.agent_ids.is_empty() {
            return Err(BackupManagerError::NoAgentsSelected);
        }
        self.select_agents(&params.agent_ids).await?;
        let has_addons = params
            .include_addons
            .as_ref()
            .map_or(false, |addons| !addons.is_empty());
        if params.include_all_addons && has_addons {
            return Err(BackupManagerError::ConflictingAddonSelection);
        }

        let mut extra_metadata = ExtraMetadata::new();
        extra_metadata.insert(
            EXTRA_INSTANCE_ID.to_string(),
            self.instance_id.get().cloned().unwrap_or_default().into(),
        );
        extra_metadata.insert(
            EXTRA_WITH_AUTOMATIC_SETTINGS.to_string(),
            with_automatic_settings.into(),
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let args = CreateBackupArgs {
            agent_ids: params.agent_ids.clone(),
            backup_name: params
                .name
                .clone()
                .unwrap_or_else(|| format!("Core {}", HA_VERSION)),
            extra_metadata,
            include_addons: params.include_addons,
            include_all_addons: params.include_all_addons,
            include_database: params.include_database,
            include_folders: params.include_folders,
            include_homeassistant,
            on_progress: Arc::new(move |event| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_event(event);
                }
            }),
            password: params.password,
            local_agent: self.local_agent_for(&params.agent_ids).await,
            platforms: self.platforms.read().await.clone(),
        };

        let (new_backup, task) = self.reader_writer.create_backup(args).await?;
        let manager = self.clone();
        let agent_ids = params.agent_ids;
        let handle = tokio::spawn(async move {
            manager
                .finish_backup(task, agent_ids, with_automatic_settings)
                .await;
        });
        *self
            .finish_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(new_backup)
    }

    async fn finish_backup(
        &self,
        task: BackupTask,
        agent_ids: Vec<String>,
        with_automatic_settings: bool,
    ) {
        let written = task
            .await
            .map_err(|e| BackupReaderWriterError::Interrupted(e.to_string()))
            .and_then(|result| result);

        match written {
            Err(err) => {
                error!("Generating backup failed: {}", err);
                self.on_event(ManagerStateEvent::create_failed(REASON_UNKNOWN_ERROR));
            }
            Ok(written) => {
                debug!(
                    "Generated new backup with backup_id {}, uploading to agents {:?}",
                    written.backup.backup_id, agent_ids
                );
                self.on_event(ManagerStateEvent::create(
                    Some(CreateBackupStage::UploadToAgents),
                    OperationState::InProgress,
                ));
                let upload = self
                    .upload_backup(&written.backup, &agent_ids, written.open_stream.clone())
                    .await;
                self.on_event(ManagerStateEvent::create(
                    Some(CreateBackupStage::CleanUp),
                    OperationState::InProgress,
                ));
                (written.release_stream)().await;

                match upload {
                    Ok(agent_errors) if agent_errors.is_empty() => {
                        if with_automatic_settings {
                            self.mark_automatic_backup_completed().await;
                            self.delete_backups_exceeding_retention().await;
                        }
                        self.on_event(ManagerStateEvent::create(None, OperationState::Completed));
                    }
                    Ok(_) => {
                        self.on_event(ManagerStateEvent::create_failed(REASON_UPLOAD_FAILED));
                    }
                    Err(err) => {
                        // Agents vanished while the archive was being written
                        error!("Uploading backup failed: {}", err);
                        self.on_event(ManagerStateEvent::create_failed(REASON_UPLOAD_FAILED));
                    }
                }
            }
        }
        self.on_event(ManagerStateEvent::Idle);
    }

    /// Create a backup from the stored automatic settings
    ///
    /// Agents configured but no longer available are skipped.
    pub async fn create_backup_with_automatic_settings(self: &Arc<Self>) -> ManagerResult<NewBackup> {
        let mut params = {
            let mut data = self.data.lock().await;
            data.config.last_attempted_automatic_backup = Some(Utc::now());
            if let Err(err) = self.store.save(&data).await {
                error!("Saving backup store failed: {}", err);
            }
            data.config.create_backup.clone()
        };

        let agents = self.agents.read().await;
        params.agent_ids.retain(|agent_id| {
            let available = agents.contains_key(agent_id);
            if !available {
                warn!("Skipping unavailable agent {} for automatic backup", agent_id);
            }
            available
        });
        drop(agents);

        self.create_backup(params, true, true).await
    }

    async fn mark_automatic_backup_completed(&self) {
        let mut data = self.data.lock().await;
        data.config.last_completed_automatic_backup = Some(Utc::now());
        if let Err(err) = self.store.save(&data).await {
            error!("Saving backup store failed: {}", err);
        }
    }

    /// Apply retention per agent to automatic backups
    pub async fn delete_backups_exceeding_retention(&self) {
        let config = self.config().await;
        let (backups, _) = self.get_backups().await;
        let now = Utc::now();

        let mut deletions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for agent_id in self.agents.read().await.keys() {
            let retention = config.retention_for(agent_id);
            if retention.is_empty() {
                continue;
            }
            let held = backups
                .values()
                .filter(|backup| backup.agents.contains_key(agent_id));
            for backup_id in backups_to_delete(held, &retention, now) {
                deletions.entry(backup_id).or_default().push(agent_id.clone());
            }
        }

        let results = join_all(
            deletions
                .iter()
                .map(|(backup_id, agent_ids)| self.delete_backup(backup_id, Some(agent_ids))),
        )
        .await;
        for ((backup_id, _), result) in deletions.iter().zip(results) {
            match result {
                Ok(agent_errors) if agent_errors.is_empty() => {
                    info!("Deleted backup {} per retention", backup_id)
                }
                Ok(agent_errors) => warn!(
                    "Retention could not delete backup {} from {:?}",
                    backup_id,
                    agent_errors.keys().collect::<Vec<_>>()
                ),
                Err(err) => warn!("Retention could not delete backup {}: {}", backup_id, err),
            }
        }
    }

    // Receive

    /// Store an uploaded archive and copy it to `agent_ids`
    pub async fn receive_backup(
        &self,
        agent_ids: &[String],
        stream: ByteStream,
        filename: Option<String>,
    ) -> ManagerResult<AgentErrors> {
        self.try_begin(ManagerStateEvent::receive(None, OperationState::InProgress))?;
        let result = self.do_receive(agent_ids, stream, filename).await;
        match &result {
            Ok(_) => self.on_event(ManagerStateEvent::receive(None, OperationState::Completed)),
            Err(err) => {
                warn!("Receiving backup failed: {}", err);
                self.on_event(ManagerStateEvent::receive(None, OperationState::Failed));
            }
        }
        self.on_event(ManagerStateEvent::Idle);
        result
    }

    async fn do_receive(
        &self,
        agent_ids: &[String],
        stream: ByteStream,
        filename: Option<String>,
    ) -> ManagerResult<AgentErrors> {
        if agent_ids.is_empty() {
            return Err(BackupManagerError::NoAgentsSelected);
        }
        self.select_agents(agent_ids).await?;

        self.on_event(ManagerStateEvent::receive(
            Some(ReceiveBackupStage::ReceiveFile),
            OperationState::InProgress,
        ));
        let written = self
            .reader_writer
            .receive_backup(ReceiveBackupArgs {
                stream,
                suggested_filename: filename.unwrap_or_else(|| "backup.tar".to_string()),
                local_agent: self.local_agent_for(agent_ids).await,
            })
            .await?;

        self.on_event(ManagerStateEvent::receive(
            Some(ReceiveBackupStage::UploadToAgents),
            OperationState::InProgress,
        ));
        let agent_errors = self
            .upload_backup(&written.backup, agent_ids, written.open_stream.clone())
            .await;
        (written.release_stream)().await;
        agent_errors
    }

    // Restore

    /// Stage a restore of `backup_id` from `params.agent_id`
    ///
    /// On success the manager stays in the restore state until restart.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        params: RestoreBackupParams,
    ) -> ManagerResult<()> {
        self.try_begin(ManagerStateEvent::restore(None, OperationState::InProgress))?;
        match self.do_restore(backup_id, params).await {
            Ok(()) => {
                self.on_event(ManagerStateEvent::restore(None, OperationState::Completed));
                Ok(())
            }
            Err(err) => {
                self.on_event(ManagerStateEvent::restore(None, OperationState::Failed));
                self.on_event(ManagerStateEvent::Idle);
                Err(err)
            }
        }
    }

    async fn do_restore(&self, backup_id: &str, params: RestoreBackupParams) -> ManagerResult<()> {
        let agent = self
            .agent(&params.agent_id)
            .await
            .ok_or_else(|| BackupManagerError::InvalidAgents(vec![params.agent_id.clone()]))?;
        if agent.get_backup(backup_id).await?.is_none() {
            return Err(BackupManagerError::BackupNotFound {
                backup_id: backup_id.to_string(),
                agent_id: params.agent_id,
            });
        }

        let id = backup_id.to_string();
        let download_agent = agent.clone();
        let open_stream = open_stream_fn(move || {
            let agent = download_agent.clone();
            let id = id.clone();
            async move {
                agent
                    .download_backup(&id)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            }
        });

        let local_agent = self.local_agents.read().await.get(&params.agent_id).cloned();
        self.reader_writer
            .restore_backup(RestoreBackupArgs {
                backup_id: backup_id.to_string(),
                open_stream,
                local_agent,
                password: params.password,
                restore_addons: params.restore_addons,
                restore_database: params.restore_database,
                restore_folders: params.restore_folders,
                restore_homeassistant: params.restore_homeassistant,
            })
            .await?;
        Ok(())
    }

    // Settings

    pub async fn config(&self) -> BackupConfigData {
        self.data.lock().await.config.clone()
    }

    /// Apply and persist a settings change, waking the scheduler
    pub async fn update_config(&self, update: BackupConfigUpdate) -> ManagerResult<BackupConfigData> {
        let mut data = self.data.lock().await;
        data.config.apply(update)?;
        self.store.save(&data).await?;
        let config = data.config.clone();
        drop(data);

        self.config_changed.notify_one();
        Ok(config)
    }

    /// Notified whenever settings change
    pub fn config_changed(&self) -> &Notify {
        &self.config_changed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use super::*;
    use crate::agent::test_support::{bytes_stream, MockAgent};
    use crate::config::{AgentConfig, RetentionConfig};
    use crate::local::CoreLocalBackupAgent;
    use crate::models::test_support::agent_backup;
    use crate::reader_writer::CoreBackupReaderWriter;

    struct Fixture {
        config: TempDir,
        restarts: Arc<AtomicUsize>,
        manager: Arc<BackupManager>,
    }

    async fn fixture() -> Fixture {
        let config = TempDir::new().unwrap();
        std::fs::write(config.path().join("configuration.yaml"), "http:\n").unwrap();
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        let reader_writer = CoreBackupReaderWriter::new(
            config.path(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let manager = Arc::new(BackupManager::new(
            Arc::new(reader_writer),
            BackupStore::new(config.path()),
        ));
        manager.load().await.unwrap();
        Fixture {
            config,
            restarts,
            manager,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn params(agent_ids: &[&str]) -> CreateBackupParams {
        CreateBackupParams {
            agent_ids: ids(agent_ids),
            ..Default::default()
        }
    }

    async fn collect_events(
        rx: &mut broadcast::Receiver<ManagerStateEvent>,
    ) -> Vec<ManagerStateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_get_backups_union_with_agent_errors() {
        let fx = fixture().await;
        let shared = agent_backup("abc123", "2025-01-01T00:00:00+00:00", false);
        let a: Arc<dyn BackupAgent> = Arc::new(
            MockAgent::new("test", "one")
                .with_backup(shared.clone())
                .await
                .with_backup(agent_backup("def456", "2025-01-02T00:00:00+00:00", false))
                .await,
        );
        let b: Arc<dyn BackupAgent> = Arc::new(
            MockAgent::new("test", "two")
                .with_backup(AgentBackup {
                    protected: true,
                    ..shared
                })
                .await,
        );
        let broken: Arc<dyn BackupAgent> = Arc::new(MockAgent::failing(
            "test",
            "broken",
            BackupAgentError::Unreachable,
        ));
        fx.manager.add_agents([a, b, broken]).await;

        let (backups, agent_errors) = fx.manager.get_backups().await;

        assert_eq!(backups.len(), 2);
        let abc = &backups["abc123"];
        assert_eq!(abc.agents.keys().collect::<Vec<_>>(), ["test.one", "test.two"]);
        assert!(abc.agents["test.two"].protected);
        assert_eq!(backups["def456"].agents.len(), 1);
        assert_eq!(agent_errors.len(), 1);
        assert_eq!(agent_errors["test.broken"], BackupAgentError::Unreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_is_concurrent() {
        let fx = fixture().await;
        let agents: Vec<Arc<dyn BackupAgent>> = (0..3)
            .map(|i| {
                Arc::new(
                    MockAgent::new("slow", &i.to_string()).with_delay(Duration::from_secs(10)),
                ) as Arc<dyn BackupAgent>
            })
            .collect();
        fx.manager.add_agents(agents).await;

        let start = tokio::time::Instant::now();
        let (_, agent_errors) = fx.manager.get_backups().await;
        assert!(agent_errors.is_empty());
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_get_backup_merges_holders() {
        let fx = fixture().await;
        let backup = agent_backup("abc123", "2025-01-01T00:00:00+00:00", false);
        let a: Arc<dyn BackupAgent> =
            Arc::new(MockAgent::new("test", "one").with_backup(backup.clone()).await);
        let b: Arc<dyn BackupAgent> = Arc::new(MockAgent::new("test", "two"));
        let broken: Arc<dyn BackupAgent> = Arc::new(MockAgent::failing(
            "test",
            "broken",
            BackupAgentError::failed("boom"),
        ));
        fx.manager.add_agents([a, b, broken]).await;

        let (found, agent_errors) = fx.manager.get_backup("abc123").await;
        let found = found.unwrap();
        assert_eq!(found.agents.keys().collect::<Vec<_>>(), ["test.one"]);
        assert!(agent_errors.contains_key("test.broken"));

        let (missing, _) = fx.manager.get_backup("nope").await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_isolates_failures_and_ignores_not_found() {
        let fx = fixture().await;
        let backup = agent_backup("abc123", "2025-01-01T00:00:00+00:00", false);
        let one = Arc::new(MockAgent::new("test", "one").with_backup(backup).await);
        let gone: Arc<dyn BackupAgent> = Arc::new(MockAgent::failing(
            "test",
            "gone",
            BackupAgentError::NotFound("abc123".into()),
        ));
        let broken: Arc<dyn BackupAgent> = Arc::new(MockAgent::failing(
            "test",
            "broken",
            BackupAgentError::failed("permission denied"),
        ));
        fx.manager
            .add_agents([one.clone() as Arc<dyn BackupAgent>, gone, broken])
            .await;

        let agent_errors = fx.manager.delete_backup("abc123", None).await.unwrap();
        assert_eq!(agent_errors.keys().collect::<Vec<_>>(), ["test.broken"]);
        assert!(one.backups.lock().await.is_empty());

        assert!(matches!(
            fx.manager.delete_backup("abc123", Some(&ids(&["test.nope"]))).await,
            Err(BackupManagerError::InvalidAgents(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_records_failed_agents() {
        let fx = fixture().await;
        let ok = Arc::new(MockAgent::new("test", "ok"));
        let broken: Arc<dyn BackupAgent> = Arc::new(MockAgent::failing(
            "test",
            "broken",
            BackupAgentError::failed("quota exceeded"),
        ));
        fx.manager
            .add_agents([ok.clone() as Arc<dyn BackupAgent>, broken])
            .await;

        let backup = agent_backup("abc123", "2025-01-01T00:00:00+00:00", false);
        let agent_errors = fx
            .manager
            .upload_backup(&backup, &ids(&["test.ok", "test.broken"]), bytes_stream(b"data"))
            .await
            .unwrap();
        assert_eq!(
            agent_errors["test.broken"],
            BackupAgentError::failed("quota exceeded")
        );
        assert_eq!(ok.backups.lock().await["abc123"].1, b"data");

        let (backups, _) = fx.manager.get_backups().await;
        assert_eq!(backups["abc123"].failed_agent_ids, vec!["test.broken"]);

        // Persisted
        let stored = BackupStore::new(fx.config.path()).load().await.unwrap().unwrap();
        assert_eq!(stored.failed_agent_ids("abc123"), ["test.broken".to_string()]);
    }

    #[tokio::test]
    async fn test_create_backup_validation() {
        let fx = fixture().await;
        fx.manager
            .add_agents([Arc::new(MockAgent::new("test", "one")) as Arc<dyn BackupAgent>])
            .await;

        assert!(matches!(
            fx.manager.create_backup(params(&[]), true, false).await,
            Err(BackupManagerError::NoAgentsSelected)
        ));
        assert!(matches!(
            fx.manager.create_backup(params(&["test.nope"]), true, false).await,
            Err(BackupManagerError::InvalidAgents(ids)) if ids == vec!["test.nope"]
        ));
        let conflicting = CreateBackupParams {
            include_all_addons: true,
            include_addons: Some(ids(&["core_ssh"])),
            ..params(&["test.one"])
        };
        assert!(matches!(
            fx.manager.create_backup(conflicting, true, false).await,
            Err(BackupManagerError::ConflictingAddonSelection)
        ));
        let folders = CreateBackupParams {
            include_folders: Some(vec![Folder::Media]),
            ..params(&["test.one"])
        };
        assert!(matches!(
            fx.manager.create_backup(folders, true, false).await,
            Err(BackupManagerError::ReaderWriter(
                BackupReaderWriterError::AddonsNotSupported
            ))
        ));
        assert_eq!(fx.manager.last_event(), ManagerStateEvent::Idle);
    }

    #[tokio::test]
    async fn test_create_backup_uploads_to_all_agents() {
        let fx = fixture().await;
        let local = Arc::new(CoreLocalBackupAgent::new(fx.config.path()));
        fx.manager.add_local_agent(local.clone()).await;
        let remote = Arc::new(MockAgent::new("test", "remote"));
        fx.manager
            .add_agents([remote.clone() as Arc<dyn BackupAgent>])
            .await;
        let mut rx = fx.manager.subscribe_events();

        let new_backup = fx
            .manager
            .create_backup(params(&["backup.local", "test.remote"]), true, false)
            .await
            .unwrap();
        // Only one job at a time
        assert!(matches!(
            fx.manager.create_backup(params(&["backup.local"]), true, false).await,
            Err(BackupManagerError::Busy(_))
        ));
        fx.manager.join_backup_task().await;

        let (backups, agent_errors) = fx.manager.get_backups().await;
        assert!(agent_errors.is_empty());
        let backup = &backups[&new_backup.backup_job_id];
        assert_eq!(
            backup.agents.keys().collect::<Vec<_>>(),
            ["backup.local", "test.remote"]
        );
        assert_eq!(backup.with_automatic_settings, Some(false));
        assert!(backup.extra_metadata.contains_key(EXTRA_INSTANCE_ID));
        assert!(local.backup_path(&new_backup.backup_job_id).exists());

        let events = collect_events(&mut rx).await;
        assert_eq!(events.first(), Some(&ManagerStateEvent::create(None, OperationState::InProgress)));
        assert!(events.contains(&ManagerStateEvent::create(
            Some(CreateBackupStage::UploadToAgents),
            OperationState::InProgress
        )));
        assert_eq!(
            &events[events.len() - 2..],
            [
                ManagerStateEvent::create(None, OperationState::Completed),
                ManagerStateEvent::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_create_backup_upload_failure() {
        let fx = fixture().await;
        fx.manager
            .add_agents([Arc::new(MockAgent::failing(
                "test",
                "broken",
                BackupAgentError::Unreachable,
            )) as Arc<dyn BackupAgent>])
            .await;
        let mut rx = fx.manager.subscribe_events();

        fx.manager
            .create_backup(params(&["test.broken"]), true, false)
            .await
            .unwrap();
        fx.manager.join_backup_task().await;

        let events = collect_events(&mut rx).await;
        assert!(events.contains(&ManagerStateEvent::create_failed(REASON_UPLOAD_FAILED)));
        assert_eq!(fx.manager.last_event(), ManagerStateEvent::Idle);
        // Temp archive released
        let tmp = fx.config.path().join(crate::constants::TEMP_BACKUP_DIR);
        assert_eq!(std::fs::read_dir(tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_automatic_backup_applies_retention() {
        let fx = fixture().await;
        let remote = Arc::new(
            MockAgent::new("test", "remote")
                .with_backup(agent_backup("old1", "2020-01-01T00:00:00+00:00", true))
                .await
                .with_backup(agent_backup("old2", "2020-01-02T00:00:00+00:00", true))
                .await
                .with_backup(agent_backup("manual", "2019-01-01T00:00:00+00:00", false))
                .await,
        );
        fx.manager
            .add_agents([remote.clone() as Arc<dyn BackupAgent>])
            .await;

        let update: BackupConfigUpdate = serde_json::from_value(serde_json::json!({
            "create_backup": {"agent_ids": ["test.remote", "test.removed"]},
            "retention": {"copies": 2},
        }))
        .unwrap();
        fx.manager.update_config(update).await.unwrap();

        let new_backup = fx
            .manager
            .create_backup_with_automatic_settings()
            .await
            .unwrap();
        fx.manager.join_backup_task().await;

        let mut held: Vec<String> = remote.backups.lock().await.keys().cloned().collect();
        held.sort();
        let mut expected = vec![new_backup.backup_job_id.clone(), "manual".into(), "old2".into()];
        expected.sort();
        assert_eq!(held, expected);

        let config = fx.manager.config().await;
        assert!(config.last_attempted_automatic_backup.is_some());
        assert!(config.last_completed_automatic_backup.is_some());
    }

    #[tokio::test]
    async fn test_per_agent_retention_override() {
        let fx = fixture().await;
        let remote = Arc::new(
            MockAgent::new("test", "remote")
                .with_backup(agent_backup("old1", "2020-01-01T00:00:00+00:00", true))
                .await
                .with_backup(agent_backup("old2", "2020-01-02T00:00:00+00:00", true))
                .await,
        );
        fx.manager
            .add_agents([remote.clone() as Arc<dyn BackupAgent>])
            .await;

        let mut agents = BTreeMap::new();
        agents.insert(
            "test.remote".to_string(),
            AgentConfig {
                protected: false,
                retention: Some(RetentionConfig {
                    copies: Some(1),
                    days: None,
                }),
            },
        );
        fx.manager
            .update_config(BackupConfigUpdate {
                agents: Some(agents),
                retention: Some(RetentionConfig {
                    copies: Some(10),
                    days: None,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        fx.manager.delete_backups_exceeding_retention().await;
        let held: Vec<String> = remote.backups.lock().await.keys().cloned().collect();
        assert_eq!(held, vec!["old2"]);
    }

    #[tokio::test]
    async fn test_receive_backup() {
        let fx = fixture().await;
        let local = Arc::new(CoreLocalBackupAgent::new(fx.config.path()));
        fx.manager.add_local_agent(local.clone()).await;
        let remote = Arc::new(MockAgent::new("test", "remote"));
        fx.manager
            .add_agents([remote.clone() as Arc<dyn BackupAgent>])
            .await;

        // Produce a real archive to upload
        let new_backup = fx
            .manager
            .create_backup(params(&["backup.local"]), true, false)
            .await
            .unwrap();
        fx.manager.join_backup_task().await;
        let stream = local
            .download_backup(&new_backup.backup_job_id)
            .await
            .unwrap();

        let agent_errors = fx
            .manager
            .receive_backup(&ids(&["test.remote"]), stream, Some("upload.tar".into()))
            .await
            .unwrap();
        assert!(agent_errors.is_empty());
        assert!(remote
            .backups
            .lock()
            .await
            .contains_key(&new_backup.backup_job_id));
        assert_eq!(fx.manager.last_event(), ManagerStateEvent::Idle);
    }

    #[tokio::test]
    async fn test_receive_garbage_fails_and_returns_to_idle() {
        let fx = fixture().await;
        fx.manager
            .add_agents([Arc::new(MockAgent::new("test", "remote")) as Arc<dyn BackupAgent>])
            .await;
        let stream = (bytes_stream(b"garbage"))().await.unwrap();

        assert!(fx
            .manager
            .receive_backup(&ids(&["test.remote"]), stream, None)
            .await
            .is_err());
        assert_eq!(fx.manager.last_event(), ManagerStateEvent::Idle);
    }

    #[tokio::test]
    async fn test_restore_backup() {
        let fx = fixture().await;
        let remote = Arc::new(
            MockAgent::new("test", "remote")
                .with_backup(agent_backup("abc123", "2025-01-01T00:00:00+00:00", false))
                .await,
        );
        fx.manager
            .add_agents([remote as Arc<dyn BackupAgent>])
            .await;
        let restore = |agent_id: &str| RestoreBackupParams {
            agent_id: agent_id.to_string(),
            password: None,
            restore_addons: None,
            restore_database: true,
            restore_folders: None,
            restore_homeassistant: true,
        };

        assert!(matches!(
            fx.manager.restore_backup("nope", restore("test.remote")).await,
            Err(BackupManagerError::BackupNotFound { .. })
        ));
        assert_eq!(fx.manager.last_event(), ManagerStateEvent::Idle);

        fx.manager
            .restore_backup("abc123", restore("test.remote"))
            .await
            .unwrap();
        assert_eq!(fx.restarts.load(Ordering::SeqCst), 1);
        let staged = fx.config.path().join(crate::constants::TEMP_BACKUP_DIR).join("abc123.tar");
        assert_eq!(std::fs::read(staged).unwrap(), b"test");
        assert!(matches!(
            fx.manager.create_backup(params(&["test.remote"]), true, false).await,
            Err(BackupManagerError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_registration() {
        let fx = fixture().await;
        fx.manager
            .add_local_agent(Arc::new(CoreLocalBackupAgent::new(fx.config.path())))
            .await;
        fx.manager
            .add_agents([
                Arc::new(MockAgent::new("nas", "attic")) as Arc<dyn BackupAgent>,
                Arc::new(MockAgent::new("nas", "cellar")) as Arc<dyn BackupAgent>,
            ])
            .await;

        let infos = fx.manager.agent_infos().await;
        assert_eq!(
            infos.iter().map(|i| i.agent_id.as_str()).collect::<Vec<_>>(),
            ["backup.local", "nas.attic", "nas.cellar"]
        );

        fx.manager.remove_agents("nas").await;
        assert_eq!(fx.manager.agent_infos().await.len(), 1);
        assert!(fx.manager.agent("nas.attic").await.is_none());
    }

    #[tokio::test]
    async fn test_update_config_persists_and_notifies() {
        let fx = fixture().await;
        let update: BackupConfigUpdate = serde_json::from_value(serde_json::json!({
            "schedule": {"recurrence": "daily"},
        }))
        .unwrap();
        fx.manager.update_config(update).await.unwrap();

        // Permit stored for the next waiter
        tokio::time::timeout(Duration::from_secs(1), fx.manager.config_changed().notified())
            .await
            .unwrap();

        let stored = BackupStore::new(fx.config.path()).load().await.unwrap().unwrap();
        assert_eq!(
            stored.config.schedule.recurrence,
            crate::config::ScheduleRecurrence::Daily
        );
    }
}
