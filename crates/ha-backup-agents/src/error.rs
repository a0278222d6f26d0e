//! Object store errors

use ha_backup::BackupAgentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unknown multipart upload {upload_id} for {key}")]
    UnknownUpload { key: String, upload_id: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

impl From<ObjectStoreError> for BackupAgentError {
    fn from(err: ObjectStoreError) -> Self {
        BackupAgentError::Failed(err.to_string())
    }
}
