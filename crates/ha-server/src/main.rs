//! Home Assistant backup server
//!
//! Main entry point: loads configuration, applies a pending restore, sets
//! up backup agents and serves the backup API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ha_api::AppState;
use ha_backup::{
    restore_backup_file, spawn_scheduler, BackupManager, BackupStore, CoreBackupReaderWriter,
    CoreLocalBackupAgent,
};
use ha_config::ServerConfig;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "homeassistant", version, about = "Home Assistant backup server")]
struct Args {
    /// Configuration directory
    #[arg(short, long, default_value = "config")]
    config: PathBuf,
}

/// Why a server run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    Restart,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!("Starting Home Assistant backup server");

    loop {
        match run(&args.config).await? {
            Exit::Stop => break,
            Exit::Restart => info!("Restarting to apply restored backup"),
        }
    }

    info!("Shutting down...");
    Ok(())
}

async fn run(config_dir: &Path) -> Result<Exit> {
    let restore_dir = config_dir.to_path_buf();
    match tokio::task::spawn_blocking(move || restore_backup_file(&restore_dir)).await? {
        Ok(true) => info!("Restored backup into {}", config_dir.display()),
        Ok(false) => {}
        Err(err) => error!("Restoring backup failed: {}", err),
    }

    let config = ServerConfig::load(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    let restart = Arc::new(Notify::new());
    let restart_hook = restart.clone();
    let reader_writer =
        CoreBackupReaderWriter::new(config_dir, Arc::new(move || restart_hook.notify_one()));
    let manager = Arc::new(BackupManager::new(
        Arc::new(reader_writer),
        BackupStore::new(config_dir),
    ));
    manager.load().await?;

    manager
        .add_local_agent(Arc::new(CoreLocalBackupAgent::new(config_dir)))
        .await;
    match ha_backup_agents::async_get_backup_agents(&config.backup.agents).await {
        Ok(agents) => manager.add_agents(agents).await,
        Err(err) => warn!("Setting up backup agents failed: {}", err),
    }
    info!("Backup agents: {:?}", manager.agent_infos().await);

    let scheduler = spawn_scheduler(manager.clone());

    let (exit_tx, mut exit_rx) = tokio::sync::watch::channel(Exit::Stop);
    let shutdown = async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Listening for ctrl-c failed: {}", err);
                }
            }
            _ = restart.notified() => {
                let _ = exit_tx.send(Exit::Restart);
            }
        }
    };

    let addr = config.http.bind_addr();
    ha_api::start_server(AppState::new(manager.clone()), &addr, shutdown)
        .await
        .with_context(|| format!("serving on {}", addr))?;

    scheduler.abort();
    manager.join_backup_task().await;
    let exit = *exit_rx.borrow_and_update();
    Ok(exit)
}
