//! WebSocket message types
//!
//! Defines all incoming and outgoing WebSocket message types.

use ha_backup::{BackupConfigUpdate, Folder};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

// =============================================================================
// Incoming Messages
// =============================================================================

/// Incoming WebSocket message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Auth {
        access_token: Option<String>,
        #[serde(default)]
        api_password: Option<String>,
    },
    #[serde(rename = "backup/agents/info")]
    BackupAgentsInfo {
        id: u64,
    },
    #[serde(rename = "backup/config/info")]
    BackupConfigInfo {
        id: u64,
    },
    #[serde(rename = "backup/config/update")]
    BackupConfigUpdate {
        id: u64,
        #[serde(flatten)]
        update: BackupConfigUpdate,
    },
    #[serde(rename = "backup/delete")]
    BackupDelete {
        id: u64,
        backup_id: String,
    },
    #[serde(rename = "backup/details")]
    BackupDetails {
        id: u64,
        backup_id: String,
    },
    #[serde(rename = "backup/generate")]
    BackupGenerate {
        id: u64,
        agent_ids: Vec<String>,
        #[serde(default)]
        include_addons: Option<Vec<String>>,
        #[serde(default)]
        include_all_addons: bool,
        #[serde(default = "default_true")]
        include_database: bool,
        #[serde(default)]
        include_folders: Option<Vec<Folder>>,
        #[serde(default = "default_true")]
        include_homeassistant: bool,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename = "backup/generate_with_automatic_settings")]
    BackupGenerateWithAutomaticSettings {
        id: u64,
    },
    #[serde(rename = "backup/info")]
    BackupInfo {
        id: u64,
    },
    #[serde(rename = "backup/restore")]
    BackupRestore {
        id: u64,
        backup_id: String,
        agent_id: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        restore_addons: Option<Vec<String>>,
        #[serde(default = "default_true")]
        restore_database: bool,
        #[serde(default)]
        restore_folders: Option<Vec<Folder>>,
        #[serde(default = "default_true")]
        restore_homeassistant: bool,
    },
    #[serde(rename = "backup/subscribe_events")]
    BackupSubscribeEvents {
        id: u64,
    },
    Ping {
        id: u64,
    },
    UnsubscribeEvents {
        id: u64,
        subscription: u64,
    },
}

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Outgoing WebSocket message to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    AuthRequired(AuthRequiredMessage),
    AuthOk(AuthOkMessage),
    AuthInvalid(AuthInvalidMessage),
    Pong(PongMessage),
    Result(ResultMessage),
    Event(EventMessage),
}

impl OutgoingMessage {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        OutgoingMessage::Result(ResultMessage {
            id,
            msg_type: "result",
            success: true,
            result: Some(result),
            error: None,
        })
    }

    pub fn error(id: u64, code: &str, message: impl Into<String>) -> Self {
        OutgoingMessage::Result(ResultMessage {
            id,
            msg_type: "result",
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AuthRequiredMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub ha_version: String,
}

#[derive(Debug, Serialize)]
pub struct AuthOkMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub ha_version: String,
}

#[derive(Debug, Serialize)]
pub struct AuthInvalidMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PongMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ResultMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct EventMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: serde_json::Value,
}
