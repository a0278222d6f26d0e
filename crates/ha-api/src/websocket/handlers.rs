//! WebSocket command handlers
//!
//! Individual handlers for each `backup/*` command.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Local;
use ha_backup::{
    AgentErrors, BackupConfigUpdate, BackupManagerError, CreateBackupParams, RestoreBackupParams,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::connection::ActiveConnection;
use super::types::{EventMessage, OutgoingMessage};

/// Result error code for a manager failure
pub fn error_code(err: &BackupManagerError) -> &'static str {
    match err {
        BackupManagerError::BackupNotFound { .. } => "not_found",
        BackupManagerError::NoAgentsSelected
        | BackupManagerError::InvalidAgents(_)
        | BackupManagerError::ConflictingAddonSelection
        | BackupManagerError::InvalidConfig(_) => "invalid_format",
        _ => "home_assistant_error",
    }
}

/// `{agent_id: message}`, the shape clients receive agent errors in
pub fn agent_errors_json(agent_errors: &AgentErrors) -> BTreeMap<String, String> {
    agent_errors
        .iter()
        .map(|(agent_id, err)| (agent_id.clone(), err.to_string()))
        .collect()
}

async fn send(tx: &mpsc::Sender<OutgoingMessage>, msg: OutgoingMessage) -> Result<(), String> {
    tx.send(msg).await.map_err(|e| e.to_string())
}

async fn send_manager_error(
    tx: &mpsc::Sender<OutgoingMessage>,
    id: u64,
    err: BackupManagerError,
) -> Result<(), String> {
    warn!("Backup command {} failed: {}", id, err);
    send(tx, OutgoingMessage::error(id, error_code(&err), err.to_string())).await
}

// =============================================================================
// Listing
// =============================================================================

/// Handle backup/info command
pub async fn handle_backup_info(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let manager = &conn.state.manager;
    let (backups, agent_errors) = manager.get_backups().await;
    let config = manager.config().await;
    let next_automatic_backup = config
        .schedule
        .next_run(&Local::now())
        .map(|next| next.to_rfc3339());

    let result = serde_json::json!({
        "agent_errors": agent_errors_json(&agent_errors),
        "backups": backups.into_values().collect::<Vec<_>>(),
        "last_attempted_automatic_backup": config.last_attempted_automatic_backup,
        "last_completed_automatic_backup": config.last_completed_automatic_backup,
        "next_automatic_backup": next_automatic_backup,
        "state": manager.last_event().manager_state(),
    });
    send(tx, OutgoingMessage::success(id, result)).await
}

/// Handle backup/details command
pub async fn handle_backup_details(
    conn: &Arc<ActiveConnection>,
    id: u64,
    backup_id: &str,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let (backup, agent_errors) = conn.state.manager.get_backup(backup_id).await;
    let result = serde_json::json!({
        "agent_errors": agent_errors_json(&agent_errors),
        "backup": backup,
    });
    send(tx, OutgoingMessage::success(id, result)).await
}

/// Handle backup/agents/info command
pub async fn handle_backup_agents_info(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let agents = conn.state.manager.agent_infos().await;
    send(
        tx,
        OutgoingMessage::success(id, serde_json::json!({ "agents": agents })),
    )
    .await
}

// =============================================================================
// Operations
// =============================================================================

/// Handle backup/delete command
pub async fn handle_backup_delete(
    conn: &Arc<ActiveConnection>,
    id: u64,
    backup_id: &str,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    match conn.state.manager.delete_backup(backup_id, None).await {
        Ok(agent_errors) => {
            let result = serde_json::json!({ "agent_errors": agent_errors_json(&agent_errors) });
            send(tx, OutgoingMessage::success(id, result)).await
        }
        Err(err) => send_manager_error(tx, id, err).await,
    }
}

/// Handle backup/generate command
pub async fn handle_backup_generate(
    conn: &Arc<ActiveConnection>,
    id: u64,
    params: CreateBackupParams,
    include_homeassistant: bool,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    match conn
        .state
        .manager
        .create_backup(params, include_homeassistant, false)
        .await
    {
        Ok(new_backup) => {
            let result = serde_json::to_value(new_backup).map_err(|e| e.to_string())?;
            send(tx, OutgoingMessage::success(id, result)).await
        }
        Err(err) => send_manager_error(tx, id, err).await,
    }
}

/// Handle backup/generate_with_automatic_settings command
pub async fn handle_backup_generate_with_automatic_settings(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    match conn
        .state
        .manager
        .create_backup_with_automatic_settings()
        .await
    {
        Ok(new_backup) => {
            let result = serde_json::to_value(new_backup).map_err(|e| e.to_string())?;
            send(tx, OutgoingMessage::success(id, result)).await
        }
        Err(err) => send_manager_error(tx, id, err).await,
    }
}

/// Handle backup/restore command
pub async fn handle_backup_restore(
    conn: &Arc<ActiveConnection>,
    id: u64,
    backup_id: &str,
    params: RestoreBackupParams,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    match conn.state.manager.restore_backup(backup_id, params).await {
        Ok(()) => send(tx, OutgoingMessage::success(id, serde_json::Value::Null)).await,
        Err(err) => send_manager_error(tx, id, err).await,
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Handle backup/config/info command
pub async fn handle_backup_config_info(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let config = conn.state.manager.config().await;
    send(
        tx,
        OutgoingMessage::success(id, serde_json::json!({ "config": config })),
    )
    .await
}

/// Handle backup/config/update command
pub async fn handle_backup_config_update(
    conn: &Arc<ActiveConnection>,
    id: u64,
    update: BackupConfigUpdate,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    match conn.state.manager.update_config(update).await {
        Ok(_) => send(tx, OutgoingMessage::success(id, serde_json::Value::Null)).await,
        Err(err) => send_manager_error(tx, id, err).await,
    }
}

// =============================================================================
// Event Subscriptions
// =============================================================================

/// Handle backup/subscribe_events command
///
/// The current manager state is sent right after the result, then every
/// state change until the subscription is cancelled.
pub async fn handle_backup_subscribe_events(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let (cancel_tx, mut cancel_rx) = broadcast::channel::<()>(1);
    conn.subscriptions.write().await.insert(id, cancel_tx);

    // Subscribe before reading the current state
    let mut event_rx = conn.state.manager.subscribe_events();
    let current = conn.state.manager.last_event();

    send(tx, OutgoingMessage::success(id, serde_json::Value::Null)).await?;
    send(tx, event_message(id, &current)).await?;

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!("Subscription {} cancelled", id);
                    break;
                }
                result = event_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if tx_clone.send(event_message(id, &event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscription {} lagged, {} events dropped", id, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
    Ok(())
}

fn event_message(id: u64, event: &ha_backup::ManagerStateEvent) -> OutgoingMessage {
    OutgoingMessage::Event(EventMessage {
        id,
        msg_type: "event",
        event: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
    })
}

/// Handle unsubscribe_events command
pub async fn handle_unsubscribe_events(
    conn: &Arc<ActiveConnection>,
    id: u64,
    subscription: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let removed = conn.subscriptions.write().await.remove(&subscription);
    match removed {
        Some(cancel_tx) => {
            let _ = cancel_tx.send(());
            send(tx, OutgoingMessage::success(id, serde_json::Value::Null)).await
        }
        None => {
            send(
                tx,
                OutgoingMessage::error(id, "not_found", "Subscription not found."),
            )
            .await
        }
    }
}
