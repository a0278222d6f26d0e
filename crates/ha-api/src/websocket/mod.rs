//! Backup WebSocket API
//!
//! Home Assistant WebSocket protocol carrying the `backup/*` commands.
//! Protocol: https://developers.home-assistant.io/docs/api/websocket
//!
//! This module is organized into:
//! - `types` - Message type definitions (IncomingMessage, OutgoingMessage, etc.)
//! - `connection` - Connection handling and authentication
//! - `dispatch` - Message routing to handlers
//! - `handlers` - Individual command handlers

mod connection;
mod dispatch;
mod handlers;
mod types;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use crate::AppState;

#[allow(unused_imports)]
pub use connection::ActiveConnection;
pub use handlers::{agent_errors_json, error_code};
#[allow(unused_imports)]
pub use types::{
    AuthInvalidMessage, AuthOkMessage, AuthRequiredMessage, ErrorInfo, EventMessage,
    IncomingMessage, OutgoingMessage, PongMessage, ResultMessage,
};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_backup::Folder;

    #[test]
    fn test_parse_auth_message() {
        let json = r#"{"type": "auth", "access_token": "test_token"}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::Auth { access_token, .. } => {
                assert_eq!(access_token, Some("test_token".to_string()));
            }
            _ => panic!("Expected Auth message"),
        }
    }

    #[test]
    fn test_parse_ping_message() {
        let json = r#"{"type": "ping", "id": 1}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::Ping { id } => {
                assert_eq!(id, 1);
            }
            _ => panic!("Expected Ping message"),
        }
    }

    #[test]
    fn test_parse_generate_defaults() {
        let json = r#"{"type": "backup/generate", "id": 3, "agent_ids": ["backup.local"]}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
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
                assert_eq!(id, 3);
                assert_eq!(agent_ids, ["backup.local"]);
                assert_eq!(include_addons, None);
                assert!(!include_all_addons);
                assert!(include_database);
                assert_eq!(include_folders, None);
                assert!(include_homeassistant);
                assert_eq!(name, None);
                assert_eq!(password, None);
            }
            _ => panic!("Expected BackupGenerate message"),
        }
    }

    #[test]
    fn test_parse_restore() {
        let json = r#"{
            "type": "backup/restore",
            "id": 4,
            "backup_id": "abc123",
            "agent_id": "nas.attic",
            "restore_database": false,
            "restore_folders": ["media"]
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::BackupRestore {
                backup_id,
                agent_id,
                restore_database,
                restore_folders,
                restore_homeassistant,
                ..
            } => {
                assert_eq!(backup_id, "abc123");
                assert_eq!(agent_id, "nas.attic");
                assert!(!restore_database);
                assert_eq!(restore_folders, Some(vec![Folder::Media]));
                assert!(restore_homeassistant);
            }
            _ => panic!("Expected BackupRestore message"),
        }
    }

    #[test]
    fn test_parse_config_update_flattens_fields() {
        let json = r#"{
            "type": "backup/config/update",
            "id": 5,
            "create_backup": {"name": null},
            "retention": {"copies": 5, "days": null}
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::BackupConfigUpdate { id, update } => {
                assert_eq!(id, 5);
                let create = update.create_backup.unwrap();
                assert_eq!(create.name, Some(None));
                assert_eq!(create.agent_ids, None);
                assert_eq!(update.retention.unwrap().copies, Some(5));
                assert!(update.schedule.is_none());
            }
            _ => panic!("Expected BackupConfigUpdate message"),
        }
    }

    #[test]
    fn test_serialize_auth_required() {
        let msg = OutgoingMessage::AuthRequired(AuthRequiredMessage {
            msg_type: "auth_required",
            ha_version: "2024.1.0".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("auth_required"));
        assert!(json.contains("2024.1.0"));
    }

    #[test]
    fn test_serialize_error_result() {
        let msg = OutgoingMessage::error(1, "not_found", "Backup not found");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 1,
                "type": "result",
                "success": false,
                "error": {"code": "not_found", "message": "Backup not found"},
            })
        );
    }
}
