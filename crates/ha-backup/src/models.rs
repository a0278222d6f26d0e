//! Backup data model
//!
//! [`AgentBackup`] is what a single agent knows about one archive.
//! [`ManagerBackup`] is the manager's aggregate over every agent holding the
//! same `backup_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Free-form metadata carried along with a backup
pub type ExtraMetadata = serde_json::Map<String, serde_json::Value>;

/// Key in [`ExtraMetadata`] identifying the instance that made the backup
pub const EXTRA_INSTANCE_ID: &str = "instance_id";

/// Key in [`ExtraMetadata`] flagging backups made by the scheduler
pub const EXTRA_WITH_AUTOMATIC_SETTINGS: &str = "with_automatic_settings";

/// Supervisor folders that can be part of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Folder {
    #[serde(rename = "share")]
    Share,
    #[serde(rename = "addons/local")]
    AddonsLocal,
    #[serde(rename = "ssl")]
    Ssl,
    #[serde(rename = "media")]
    Media,
}

/// Add-on included in a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonInfo {
    pub name: String,
    pub slug: String,
    pub version: String,
}

/// A backup as seen by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBackup {
    #[serde(default)]
    pub addons: Vec<AddonInfo>,
    pub backup_id: String,
    #[serde(default)]
    pub database_included: bool,
    /// ISO-8601 timestamp
    pub date: String,
    #[serde(default)]
    pub extra_metadata: ExtraMetadata,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub homeassistant_included: bool,
    #[serde(default)]
    pub homeassistant_version: Option<String>,
    pub name: String,
    pub protected: bool,
    /// Archive size in bytes
    pub size: u64,
}

impl AgentBackup {
    /// Whether the scheduler created this backup; `None` if unknown
    pub fn with_automatic_settings(&self) -> Option<bool> {
        self.extra_metadata
            .get(EXTRA_WITH_AUTOMATIC_SETTINGS)
            .and_then(serde_json::Value::as_bool)
    }

    /// Parsed `date`, `None` if it isn't RFC 3339
    pub fn parsed_date(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.date).ok()
    }
}

/// Per-agent view of an aggregated backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBackupStatus {
    pub protected: bool,
    pub size: u64,
}

/// A backup aggregated across every agent holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerBackup {
    pub addons: Vec<AddonInfo>,
    /// Agents holding this backup, keyed by agent id
    pub agents: BTreeMap<String, AgentBackupStatus>,
    pub backup_id: String,
    pub database_included: bool,
    pub date: String,
    pub extra_metadata: ExtraMetadata,
    /// Agents an upload of this backup failed on
    pub failed_agent_ids: Vec<String>,
    pub folders: Vec<Folder>,
    pub homeassistant_included: bool,
    pub homeassistant_version: Option<String>,
    pub name: String,
    pub with_automatic_settings: Option<bool>,
}

impl ManagerBackup {
    /// Start an aggregate from the first agent reporting the backup
    pub fn from_agent_backup(backup: &AgentBackup) -> Self {
        Self {
            addons: backup.addons.clone(),
            agents: BTreeMap::new(),
            backup_id: backup.backup_id.clone(),
            database_included: backup.database_included,
            date: backup.date.clone(),
            extra_metadata: backup.extra_metadata.clone(),
            failed_agent_ids: Vec::new(),
            folders: backup.folders.clone(),
            homeassistant_included: backup.homeassistant_included,
            homeassistant_version: backup.homeassistant_version.clone(),
            name: backup.name.clone(),
            with_automatic_settings: backup.with_automatic_settings(),
        }
    }

    /// Record that `agent_id` holds this backup
    pub fn add_agent(&mut self, agent_id: &str, backup: &AgentBackup) {
        self.agents.insert(
            agent_id.to_string(),
            AgentBackupStatus {
                protected: backup.protected,
                size: backup.size,
            },
        );
    }

    pub fn parsed_date(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.date).ok()
    }
}

/// Agent listing entry for the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAgentInfo {
    pub agent_id: String,
    pub name: String,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_backup_minimal_json() {
        let backup: AgentBackup = serde_json::from_str(
            r#"{
                "backup_id": "abc123",
                "date": "1970-01-01T00:00:00.000Z",
                "name": "Test",
                "protected": false,
                "size": 0
            }"#,
        )
        .unwrap();

        assert_eq!(backup.backup_id, "abc123");
        assert!(backup.addons.is_empty());
        assert!(!backup.homeassistant_included);
        assert_eq!(backup.with_automatic_settings(), None);
        assert!(backup.parsed_date().is_some());
    }

    #[test]
    fn test_folder_names() {
        let folders: Vec<Folder> = serde_json::from_str(r#"["media", "addons/local"]"#).unwrap();
        assert_eq!(folders, vec![Folder::Media, Folder::AddonsLocal]);
        assert_eq!(
            serde_json::to_string(&Folder::Share).unwrap(),
            r#""share""#
        );
    }

    #[test]
    fn test_manager_backup_aggregation() {
        let backup = test_support::agent_backup("abc123", "2025-01-01T04:45:00+00:00", true);
        let mut aggregate = ManagerBackup::from_agent_backup(&backup);
        aggregate.add_agent("backup.local", &backup);
        aggregate.add_agent("nas.attic", &AgentBackup {
            protected: true,
            ..backup.clone()
        });

        assert_eq!(aggregate.with_automatic_settings, Some(true));
        assert_eq!(aggregate.agents.len(), 2);
        assert!(aggregate.agents["nas.attic"].protected);
        assert!(!aggregate.agents["backup.local"].protected);
    }
}
