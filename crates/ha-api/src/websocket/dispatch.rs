//! WebSocket message dispatch
//!
//! Routes incoming messages to the appropriate handler.

use std::sync::Arc;

use ha_backup::{CreateBackupParams, RestoreBackupParams};
use tokio::sync::mpsc;
use tracing::warn;

use super::connection::ActiveConnection;
use super::handlers;
use super::types::{IncomingMessage, OutgoingMessage, PongMessage};

/// Handle an incoming message
pub async fn handle_message(
    conn: &Arc<ActiveConnection>,
    text: &str,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let msg: IncomingMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            let json = serde_json::from_str::<serde_json::Value>(text).ok();
            let id = json.as_ref().and_then(|j| j.get("id")).and_then(|i| i.as_u64());
            if let Some(msg_type) = json.as_ref().and_then(|j| j.get("type")).and_then(|t| t.as_str()) {
                warn!("Unhandled WebSocket message type: {}", msg_type);
            }
            // Malformed commands carrying an id still get a result
            if let Some(id) = id {
                let reply = OutgoingMessage::error(id, "invalid_format", e.to_string());
                tx.send(reply).await.map_err(|e| e.to_string())?;
            }
            return Err(format!("Invalid message format: {}", e));
        }
    };

    match msg {
        IncomingMessage::Auth { .. } => {
            // Already authenticated, ignore
            Ok(())
        }
        IncomingMessage::BackupAgentsInfo { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_agents_info(conn, id, tx).await
        }
        IncomingMessage::BackupConfigInfo { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_config_info(conn, id, tx).await
        }
        IncomingMessage::BackupConfigUpdate { id, update } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_config_update(conn, id, update, tx).await
        }
        IncomingMessage::BackupDelete { id, backup_id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_delete(conn, id, &backup_id, tx).await
        }
        IncomingMessage::BackupDetails { id, backup_id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_details(conn, id, &backup_id, tx).await
        }
        IncomingMessage::BackupGenerate {
            id,
            agent_ids,
            include_addons,
            include_all_addons,
            include_database,
            include_folders,
            include_homeassistant,
            name,
            password,
        } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            let params = CreateBackupParams {
                agent_ids,
                include_addons,
                include_all_addons,
                include_database,
                include_folders,
                name,
                password,
            };
            handlers::handle_backup_generate(conn, id, params, include_homeassistant, tx).await
        }
        IncomingMessage::BackupGenerateWithAutomaticSettings { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_generate_with_automatic_settings(conn, id, tx).await
        }
        IncomingMessage::BackupInfo { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_info(conn, id, tx).await
        }
        IncomingMessage::BackupRestore {
            id,
            backup_id,
            agent_id,
            password,
            restore_addons,
            restore_database,
            restore_folders,
            restore_homeassistant,
        } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            let params = RestoreBackupParams {
                agent_id,
                password,
                restore_addons,
                restore_database,
                restore_folders,
                restore_homeassistant,
            };
            handlers::handle_backup_restore(conn, id, &backup_id, params, tx).await
        }
        IncomingMessage::BackupSubscribeEvents { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_backup_subscribe_events(conn, id, tx).await
        }
        IncomingMessage::Ping { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            let pong = OutgoingMessage::Pong(PongMessage {
                id,
                msg_type: "pong",
            });
            tx.send(pong).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        IncomingMessage::UnsubscribeEvents { id, subscription } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_unsubscribe_events(conn, id, subscription, tx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ha_backup::{
        BackupAgent, BackupManager, BackupStore, CoreBackupReaderWriter, CoreLocalBackupAgent,
    };
    use ha_backup_agents::{InMemoryObjectStore, ObjectStorageBackupAgent};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::AppState;

    struct Fixture {
        _config: TempDir,
        conn: Arc<ActiveConnection>,
        tx: mpsc::Sender<OutgoingMessage>,
        rx: mpsc::Receiver<OutgoingMessage>,
    }

    impl Fixture {
        async fn call(&mut self, msg: Value) -> Value {
            handle_message(&self.conn, &msg.to_string(), &self.tx)
                .await
                .unwrap();
            self.next().await
        }

        async fn next(&mut self) -> Value {
            let msg = self.rx.recv().await.unwrap();
            serde_json::to_value(msg).unwrap()
        }

        fn manager(&self) -> &Arc<BackupManager> {
            &self.conn.state.manager
        }
    }

    async fn fixture() -> Fixture {
        let config = TempDir::new().unwrap();
        std::fs::write(config.path().join("configuration.yaml"), "http:\n").unwrap();
        let reader_writer = CoreBackupReaderWriter::new(config.path(), Arc::new(|| {}));
        let manager = Arc::new(BackupManager::new(
            Arc::new(reader_writer),
            BackupStore::new(config.path()),
        ));
        manager.load().await.unwrap();
        manager
            .add_local_agent(Arc::new(CoreLocalBackupAgent::new(config.path())))
            .await;
        let remote = ObjectStorageBackupAgent::new(
            "memory",
            "scratch",
            "Scratch",
            Arc::new(InMemoryObjectStore::new()),
        );
        manager
            .add_agents([Arc::new(remote) as Arc<dyn BackupAgent>])
            .await;

        let (tx, rx) = mpsc::channel(16);
        Fixture {
            _config: config,
            conn: Arc::new(ActiveConnection::new(AppState::new(manager))),
            tx,
            rx,
        }
    }

    #[tokio::test]
    async fn test_ping_and_id_reuse() {
        let mut fx = fixture().await;
        let pong = fx.call(json!({"type": "ping", "id": 1})).await;
        assert_eq!(pong, json!({"id": 1, "type": "pong"}));

        let err = handle_message(&fx.conn, r#"{"type": "ping", "id": 1}"#, &fx.tx).await;
        assert_eq!(err, Err("id_reuse".to_string()));
    }

    #[tokio::test]
    async fn test_agents_info() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({"type": "backup/agents/info", "id": 1}))
            .await;
        assert_eq!(result["success"], true);
        assert_eq!(
            result["result"]["agents"],
            json!([
                {"agent_id": "backup.local", "name": "local"},
                {"agent_id": "memory.scratch", "name": "Scratch"},
            ])
        );
    }

    #[tokio::test]
    async fn test_generate_then_info_and_details() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({
                "type": "backup/generate",
                "id": 1,
                "agent_ids": ["backup.local", "memory.scratch"],
                "name": "Test",
            }))
            .await;
        assert_eq!(result["success"], true, "{result}");
        let backup_id = result["result"]["backup_job_id"].as_str().unwrap().to_string();
        fx.manager().join_backup_task().await;

        let info = fx.call(json!({"type": "backup/info", "id": 2})).await;
        assert_eq!(info["result"]["agent_errors"], json!({}));
        assert_eq!(info["result"]["state"], "idle");
        let backups = info["result"]["backups"].as_array().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0]["backup_id"], backup_id.as_str());
        assert_eq!(backups[0]["name"], "Test");
        assert!(backups[0]["agents"]["backup.local"].is_object());
        assert!(backups[0]["agents"]["memory.scratch"].is_object());

        let details = fx
            .call(json!({"type": "backup/details", "id": 3, "backup_id": backup_id}))
            .await;
        assert_eq!(details["result"]["backup"]["backup_id"], backup_id.as_str());

        let missing = fx
            .call(json!({"type": "backup/details", "id": 4, "backup_id": "nope"}))
            .await;
        assert_eq!(missing["result"]["backup"], Value::Null);
    }

    #[tokio::test]
    async fn test_generate_validation_error() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({"type": "backup/generate", "id": 1, "agent_ids": []}))
            .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"]["code"], "invalid_format");

        let result = fx
            .call(json!({"type": "backup/generate", "id": 2, "agent_ids": ["nas.nope"]}))
            .await;
        assert_eq!(result["error"]["code"], "invalid_format");
    }

    #[tokio::test]
    async fn test_delete() {
        let mut fx = fixture().await;
        fx.call(json!({
            "type": "backup/generate",
            "id": 1,
            "agent_ids": ["memory.scratch"],
        }))
        .await;
        fx.manager().join_backup_task().await;
        let (backups, _) = fx.manager().get_backups().await;
        let backup_id = backups.keys().next().unwrap().clone();

        let result = fx
            .call(json!({"type": "backup/delete", "id": 2, "backup_id": backup_id}))
            .await;
        assert_eq!(result["result"], json!({"agent_errors": {}}));
        assert!(fx.manager().get_backups().await.0.is_empty());
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({
                "type": "backup/restore",
                "id": 1,
                "backup_id": "nope",
                "agent_id": "backup.local",
            }))
            .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_config_update_and_info() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({
                "type": "backup/config/update",
                "id": 1,
                "create_backup": {"agent_ids": ["memory.scratch"], "name": "Nightly"},
                "retention": {"copies": 3, "days": null},
                "schedule": {"recurrence": "daily", "time": "03:00"},
            }))
            .await;
        assert_eq!(result["success"], true, "{result}");

        let info = fx.call(json!({"type": "backup/config/info", "id": 2})).await;
        let config = &info["result"]["config"];
        assert_eq!(config["create_backup"]["agent_ids"], json!(["memory.scratch"]));
        assert_eq!(config["create_backup"]["name"], "Nightly");
        assert_eq!(config["retention"]["copies"], 3);
        assert_eq!(config["schedule"]["recurrence"], "daily");

        let info = fx.call(json!({"type": "backup/info", "id": 3})).await;
        assert!(info["result"]["next_automatic_backup"].is_string());

        let bad = fx
            .call(json!({
                "type": "backup/config/update",
                "id": 4,
                "schedule": {"time": "25:99"},
            }))
            .await;
        assert_eq!(bad["success"], false);
    }

    #[tokio::test]
    async fn test_subscribe_events() {
        let mut fx = fixture().await;
        let result = fx
            .call(json!({"type": "backup/subscribe_events", "id": 1}))
            .await;
        assert_eq!(result["success"], true);
        let initial = fx.next().await;
        assert_eq!(
            initial,
            json!({"id": 1, "type": "event", "event": {"manager_state": "idle"}})
        );

        handle_message(
            &fx.conn,
            &json!({"type": "backup/generate", "id": 2, "agent_ids": ["memory.scratch"]})
                .to_string(),
            &fx.tx,
        )
        .await
        .unwrap();
        // Events and the generate result interleave; read until back to idle
        let mut generated = false;
        let mut events = Vec::new();
        loop {
            let msg = fx.next().await;
            if msg["type"] == "result" {
                assert_eq!(msg["id"], 2);
                generated = msg["success"] == true;
                continue;
            }
            events.push(msg["event"].clone());
            if msg["event"]["manager_state"] == "idle" {
                break;
            }
        }
        assert!(generated);
        assert!(events.contains(&json!({
            "manager_state": "create_backup",
            "stage": null,
            "state": "completed",
        })));
        fx.manager().join_backup_task().await;

        let unsub = fx
            .call(json!({"type": "unsubscribe_events", "id": 3, "subscription": 1}))
            .await;
        assert_eq!(unsub["success"], true);
        let missing = fx
            .call(json!({"type": "unsubscribe_events", "id": 4, "subscription": 1}))
            .await;
        assert_eq!(missing["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_command_gets_error_result() {
        let mut fx = fixture().await;
        let err = handle_message(
            &fx.conn,
            r#"{"type": "backup/delete", "id": 7}"#,
            &fx.tx,
        )
        .await;
        assert!(err.is_err());
        let reply = fx.next().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], "invalid_format");
    }
}
