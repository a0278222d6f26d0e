//! Manager state and progress events

use std::fmt;

use serde::{Deserialize, Serialize};

/// What the manager is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupManagerState {
    Idle,
    CreateBackup,
    ReceiveBackup,
    RestoreBackup,
}

impl fmt::Display for BackupManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::CreateBackup => "create_backup",
            Self::ReceiveBackup => "receive_backup",
            Self::RestoreBackup => "restore_backup",
        };
        f.write_str(s)
    }
}

/// Outcome of a long-running manager operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateBackupStage {
    HomeAssistant,
    UploadToAgents,
    CleanUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveBackupStage {
    ReceiveFile,
    UploadToAgents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreBackupStage {
    HomeAssistant,
}

/// Event broadcast to `backup/subscribe_events` subscribers
///
/// Serialized as `{"manager_state": "...", "stage": ..., "state": ..., "reason": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "manager_state", rename_all = "snake_case")]
pub enum ManagerStateEvent {
    Idle,
    CreateBackup {
        stage: Option<CreateBackupStage>,
        state: OperationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ReceiveBackup {
        stage: Option<ReceiveBackupStage>,
        state: OperationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RestoreBackup {
        stage: Option<RestoreBackupStage>,
        state: OperationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ManagerStateEvent {
    pub fn manager_state(&self) -> BackupManagerState {
        match self {
            Self::Idle => BackupManagerState::Idle,
            Self::CreateBackup { .. } => BackupManagerState::CreateBackup,
            Self::ReceiveBackup { .. } => BackupManagerState::ReceiveBackup,
            Self::RestoreBackup { .. } => BackupManagerState::RestoreBackup,
        }
    }

    /// Operation state, `None` for idle
    pub fn state(&self) -> Option<OperationState> {
        match self {
            Self::Idle => None,
            Self::CreateBackup { state, .. }
            | Self::ReceiveBackup { state, .. }
            | Self::RestoreBackup { state, .. } => Some(*state),
        }
    }

    pub fn create(stage: Option<CreateBackupStage>, state: OperationState) -> Self {
        Self::CreateBackup {
            stage,
            state,
            reason: None,
        }
    }

    pub fn create_failed(reason: impl Into<String>) -> Self {
        Self::CreateBackup {
            stage: None,
            state: OperationState::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn receive(stage: Option<ReceiveBackupStage>, state: OperationState) -> Self {
        Self::ReceiveBackup {
            stage,
            state,
            reason: None,
        }
    }

    pub fn restore(stage: Option<RestoreBackupStage>, state: OperationState) -> Self {
        Self::RestoreBackup {
            stage,
            state,
            reason: None,
        }
    }
}
