//! Automatic backup schedule

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::BackupManager;

/// Run automatic backups per the stored schedule until aborted
///
/// The schedule is re-read whenever settings change.
pub fn spawn_scheduler(manager: Arc<BackupManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_run: Option<DateTime<Local>> = None;
        loop {
            let schedule = manager.config().await.schedule;
            let after = match last_run {
                Some(last) => last.max(Local::now()),
                None => Local::now(),
            };

            let Some(next) = schedule.next_run(&after) else {
                debug!("No automatic backups scheduled");
                manager.config_changed().notified().await;
                continue;
            };
            debug!("Next automatic backup at {}", next);

            let wait = (next - Local::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = manager.config_changed().notified() => continue,
            }

            last_run = Some(next);
            info!("Starting automatic backup");
            if let Err(err) = manager.create_backup_with_automatic_settings().await {
                warn!("Automatic backup failed to start: {}", err);
            }
        }
    })
}
