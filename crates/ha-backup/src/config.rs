//! Backup settings: automatic backup parameters, schedule and retention
//!
//! Settings are edited through the API and persisted in `.storage/backup`,
//! not in configuration.yaml.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BackupManagerError, ManagerResult};
use crate::models::{Folder, ManagerBackup};

/// Time automatic backups run at when none is configured
pub const DEFAULT_BACKUP_TIME: &str = "04:45";

fn default_true() -> bool {
    true
}

/// Parameters for backups created with automatic settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBackupParams {
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub include_addons: Option<Vec<String>>,
    #[serde(default)]
    pub include_all_addons: bool,
    #[serde(default = "default_true")]
    pub include_database: bool,
    #[serde(default)]
    pub include_folders: Option<Vec<Folder>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for CreateBackupParams {
    fn default() -> Self {
        Self {
            agent_ids: Vec::new(),
            include_addons: None,
            include_all_addons: false,
            include_database: true,
            include_folders: None,
            name: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep at most this many automatic backups
    pub copies: Option<u32>,
    /// Delete automatic backups older than this many days
    pub days: Option<u32>,
}

impl RetentionConfig {
    fn validate(&self) -> ManagerResult<()> {
        if self.copies == Some(0) || self.days == Some(0) {
            return Err(BackupManagerError::InvalidConfig(
                "retention copies and days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_none() && self.days.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRecurrence {
    #[default]
    Never,
    Daily,
    CustomDays,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<Day> for Weekday {
    fn from(day: Day) -> Self {
        match day {
            Day::Mon => Weekday::Mon,
            Day::Tue => Weekday::Tue,
            Day::Wed => Weekday::Wed,
            Day::Thu => Weekday::Thu,
            Day::Fri => Weekday::Fri,
            Day::Sat => Weekday::Sat,
            Day::Sun => Weekday::Sun,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub days: Vec<Day>,
    #[serde(default)]
    pub recurrence: ScheduleRecurrence,
    /// "HH:MM", local time
    #[serde(default)]
    pub time: Option<String>,
}

impl ScheduleConfig {
    pub fn time_of_day(&self) -> ManagerResult<NaiveTime> {
        let raw = self.time.as_deref().unwrap_or(DEFAULT_BACKUP_TIME);
        NaiveTime::parse_from_str(raw, "%H:%M")
            .map_err(|_| BackupManagerError::InvalidConfig(format!("invalid schedule time: {}", raw)))
    }

    fn validate(&self) -> ManagerResult<()> {
        self.time_of_day()?;
        if self.recurrence == ScheduleRecurrence::CustomDays && self.days.is_empty() {
            return Err(BackupManagerError::InvalidConfig(
                "custom_days recurrence needs at least one day".to_string(),
            ));
        }
        Ok(())
    }

    /// First scheduled run strictly after `after`, `None` when nothing is scheduled
    pub fn next_run<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let time = self.time_of_day().ok()?;
        let tz = after.timezone();
        let today = after.date_naive();

        (0..=7)
            .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
            .filter(|date| match self.recurrence {
                ScheduleRecurrence::Never => false,
                ScheduleRecurrence::Daily => true,
                ScheduleRecurrence::CustomDays => self
                    .days
                    .iter()
                    .any(|day| Weekday::from(*day) == date.weekday()),
            })
            .filter_map(|date| tz.from_local_datetime(&date.and_time(time)).earliest())
            .find(|candidate| candidate > after)
    }
}

/// Per-agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub protected: bool,
    /// Overrides the global retention for this agent
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            protected: true,
            retention: None,
        }
    }
}

/// Persisted backup settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupConfigData {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub automatic_backups_configured: bool,
    #[serde(default)]
    pub create_backup: CreateBackupParams,
    #[serde(default)]
    pub last_attempted_automatic_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_completed_automatic_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl BackupConfigData {
    /// Retention applying to `agent_id`
    pub fn retention_for(&self, agent_id: &str) -> RetentionConfig {
        self.agents
            .get(agent_id)
            .and_then(|agent| agent.retention)
            .unwrap_or(self.retention)
    }

    /// Apply a partial update; nothing changes if validation fails
    pub fn apply(&mut self, update: BackupConfigUpdate) -> ManagerResult<()> {
        let mut next = self.clone();

        if let Some(agents) = update.agents {
            for agent in agents.values() {
                if let Some(retention) = &agent.retention {
                    retention.validate()?;
                }
            }
            next.agents = agents;
        }
        if let Some(configured) = update.automatic_backups_configured {
            next.automatic_backups_configured = configured;
        }
        if let Some(create) = update.create_backup {
            create.apply_to(&mut next.create_backup);
            if next.create_backup.include_all_addons
                && next
                    .create_backup
                    .include_addons
                    .as_ref()
                    .map_or(false, |addons| !addons.is_empty())
            {
                return Err(BackupManagerError::ConflictingAddonSelection);
            }
        }
        if let Some(retention) = update.retention {
            retention.validate()?;
            next.retention = retention;
        }
        if let Some(schedule) = update.schedule {
            schedule.apply_to(&mut next.schedule);
            next.schedule.validate()?;
        }

        *self = next;
        Ok(())
    }
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`)
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreateBackupUpdate {
    #[serde(default)]
    pub agent_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub include_addons: Option<Option<Vec<String>>>,
    #[serde(default)]
    pub include_all_addons: Option<bool>,
    #[serde(default)]
    pub include_database: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub include_folders: Option<Option<Vec<Folder>>>,
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub password: Option<Option<String>>,
}

impl CreateBackupUpdate {
    fn apply_to(self, params: &mut CreateBackupParams) {
        if let Some(v) = self.agent_ids {
            params.agent_ids = v;
        }
        if let Some(v) = self.include_addons {
            params.include_addons = v;
        }
        if let Some(v) = self.include_all_addons {
            params.include_all_addons = v;
        }
        if let Some(v) = self.include_database {
            params.include_database = v;
        }
        if let Some(v) = self.include_folders {
            params.include_folders = v;
        }
        if let Some(v) = self.name {
            params.name = v;
        }
        if let Some(v) = self.password {
            params.password = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub days: Option<Vec<Day>>,
    #[serde(default)]
    pub recurrence: Option<ScheduleRecurrence>,
    #[serde(default, deserialize_with = "double_option")]
    pub time: Option<Option<String>>,
}

impl ScheduleUpdate {
    fn apply_to(self, schedule: &mut ScheduleConfig) {
        if let Some(v) = self.days {
            schedule.days = v;
        }
        if let Some(v) = self.recurrence {
            schedule.recurrence = v;
        }
        if let Some(v) = self.time {
            schedule.time = v;
        }
    }
}

/// Body of `backup/config/update`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackupConfigUpdate {
    #[serde(default)]
    pub agents: Option<BTreeMap<String, AgentConfig>>,
    #[serde(default)]
    pub automatic_backups_configured: Option<bool>,
    #[serde(default)]
    pub create_backup: Option<CreateBackupUpdate>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub schedule: Option<ScheduleUpdate>,
}

/// Ids of automatic backups `retention` says should go
///
/// `backups` are the backups one agent holds; manual backups are never
/// candidates and the newest automatic backup is always kept.
pub fn backups_to_delete<'a>(
    backups: impl IntoIterator<Item = &'a ManagerBackup>,
    retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut automatic: Vec<(DateTime<Utc>, &ManagerBackup)> = backups
        .into_iter()
        .filter(|backup| backup.with_automatic_settings == Some(true))
        .filter_map(|backup| Some((backup.parsed_date()?.with_timezone(&Utc), backup)))
        .collect();
    automatic.sort_by(|a, b| b.0.cmp(&a.0));

    let cutoff = retention
        .days
        .map(|days| now - Duration::days(i64::from(days)));

    automatic
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(idx, (date, _))| {
            let over_copies = retention.copies.map_or(false, |copies| *idx >= copies as usize);
            let too_old = cutoff.map_or(false, |cutoff| *date < cutoff);
            over_copies || too_old
        })
        .map(|(_, (_, backup))| backup.backup_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::agent_backup;
    use chrono::FixedOffset;
    use serde_json::json;

    fn manager_backup(id: &str, date: &str, automatic: bool) -> ManagerBackup {
        ManagerBackup::from_agent_backup(&agent_backup(id, date, automatic))
    }

    #[test]
    fn test_defaults() {
        let config: BackupConfigData = serde_json::from_value(json!({})).unwrap();
        assert!(config.create_backup.include_database);
        assert_eq!(config.schedule.recurrence, ScheduleRecurrence::Never);
        assert!(config.retention.is_empty());
        assert_eq!(AgentConfig::default(), AgentConfig { protected: true, retention: None });
    }

    #[test]
    fn test_update_null_vs_absent() {
        let mut config = BackupConfigData::default();
        config.create_backup.name = Some("Nightly".into());
        config.create_backup.password = Some("hunter2".into());

        let update: BackupConfigUpdate = serde_json::from_value(json!({
            "create_backup": {"agent_ids": ["backup.local"], "password": null},
            "schedule": {"recurrence": "daily", "time": "03:30"},
            "retention": {"copies": 3, "days": null},
        }))
        .unwrap();
        config.apply(update).unwrap();

        assert_eq!(config.create_backup.agent_ids, vec!["backup.local"]);
        assert_eq!(config.create_backup.name.as_deref(), Some("Nightly"));
        assert_eq!(config.create_backup.password, None);
        assert_eq!(config.schedule.recurrence, ScheduleRecurrence::Daily);
        assert_eq!(config.schedule.time.as_deref(), Some("03:30"));
        assert_eq!(config.retention, RetentionConfig { copies: Some(3), days: None });
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = BackupConfigData::default();
        let before = config.clone();

        let update: BackupConfigUpdate = serde_json::from_value(json!({
            "automatic_backups_configured": true,
            "retention": {"copies": 0, "days": null},
        }))
        .unwrap();
        assert!(matches!(
            config.apply(update),
            Err(BackupManagerError::InvalidConfig(_))
        ));

        let update: BackupConfigUpdate =
            serde_json::from_value(json!({"schedule": {"time": "25:00"}})).unwrap();
        assert!(config.apply(update).is_err());

        let update: BackupConfigUpdate = serde_json::from_value(json!({
            "create_backup": {"include_all_addons": true, "include_addons": ["core_ssh"]},
        }))
        .unwrap();
        assert!(matches!(
            config.apply(update),
            Err(BackupManagerError::ConflictingAddonSelection)
        ));

        assert_eq!(config, before);
    }

    #[test]
    fn test_next_run_daily() {
        let schedule = ScheduleConfig {
            recurrence: ScheduleRecurrence::Daily,
            ..Default::default()
        };
        let tz = FixedOffset::east_opt(3600).unwrap();

        let before = tz.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap();
        assert_eq!(
            schedule.next_run(&before),
            Some(tz.with_ymd_and_hms(2025, 1, 10, 4, 45, 0).unwrap())
        );

        let exactly = tz.with_ymd_and_hms(2025, 1, 10, 4, 45, 0).unwrap();
        assert_eq!(
            schedule.next_run(&exactly),
            Some(tz.with_ymd_and_hms(2025, 1, 11, 4, 45, 0).unwrap())
        );
    }

    #[test]
    fn test_next_run_custom_days_and_never() {
        let schedule = ScheduleConfig {
            days: vec![Day::Mon, Day::Thu],
            recurrence: ScheduleRecurrence::CustomDays,
            time: Some("22:00".into()),
        };
        // 2025-01-10 is a Friday
        let friday = Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_run(&friday),
            Some(Utc.with_ymd_and_hms(2025, 1, 13, 22, 0, 0).unwrap())
        );

        let never = ScheduleConfig::default();
        assert_eq!(never.next_run(&friday), None);
    }

    #[test]
    fn test_retention_by_copies_keeps_newest_and_manual() {
        let backups = vec![
            manager_backup("a", "2025-01-01T04:45:00+00:00", true),
            manager_backup("b", "2025-01-02T04:45:00+00:00", true),
            manager_backup("c", "2025-01-03T04:45:00+00:00", true),
            manager_backup("manual", "2024-01-01T00:00:00+00:00", false),
        ];
        let retention = RetentionConfig { copies: Some(2), days: None };
        let now = Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap();

        assert_eq!(backups_to_delete(&backups, &retention, now), vec!["a"]);
    }

    #[test]
    fn test_retention_by_days_never_deletes_newest() {
        let backups = vec![
            manager_backup("old", "2024-12-01T04:45:00+00:00", true),
            manager_backup("older", "2024-11-01T04:45:00+00:00", true),
        ];
        let retention = RetentionConfig { copies: None, days: Some(7) };
        let now = Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap();

        assert_eq!(backups_to_delete(&backups, &retention, now), vec!["older"]);
    }

    #[test]
    fn test_agent_retention_override() {
        let mut config = BackupConfigData::default();
        config.retention = RetentionConfig { copies: Some(5), days: None };
        config.agents.insert(
            "nas.attic".into(),
            AgentConfig {
                protected: false,
                retention: Some(RetentionConfig { copies: Some(1), days: None }),
            },
        );

        assert_eq!(config.retention_for("nas.attic").copies, Some(1));
        assert_eq!(config.retention_for("backup.local").copies, Some(5));
    }
}
