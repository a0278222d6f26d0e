//! Backup archive transfer over HTTP
//!
//! `GET /api/backup/download/:backup_id?agent_id=...` streams an archive out
//! of one agent. `POST /api/backup/upload?agent_id=...&agent_id=...` takes a
//! raw archive body and stores it on every listed agent.

use std::io;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{StreamExt, TryStreamExt};
use ha_backup::{
    suggested_filename, BackupAgentError, BackupManagerError, BackupReaderWriterError, ByteStream,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::websocket::agent_errors_json;
use crate::{AppState, ErrorResponse};

/// Error response: status plus `{"message": ...}`
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<BackupManagerError> for ApiError {
    fn from(err: BackupManagerError) -> Self {
        let status = match &err {
            BackupManagerError::Busy(_) => StatusCode::CONFLICT,
            BackupManagerError::BackupNotFound { .. } => StatusCode::NOT_FOUND,
            BackupManagerError::NoAgentsSelected
            | BackupManagerError::InvalidAgents(_)
            | BackupManagerError::ReaderWriter(BackupReaderWriterError::InvalidArchive(_)) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Any non-empty bearer token is accepted
pub fn require_auth(headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if token.is_empty() {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub agent_id: String,
}

/// GET /api/backup/download/:backup_id - Stream an archive from one agent
pub async fn download_backup(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&headers)?;
    let agent = state
        .manager
        .agent(&query.agent_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Invalid agent selected"))?;

    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "Backup not found");
    let backup = match agent.get_backup(&backup_id).await {
        Ok(Some(backup)) => backup,
        Ok(None) | Err(BackupAgentError::NotFound(_)) => return Err(not_found()),
        Err(err) => {
            warn!("Could not look up backup {} on {}: {}", backup_id, query.agent_id, err);
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
        }
    };
    let stream = match agent.download_backup(&backup_id).await {
        Ok(stream) => stream,
        Err(BackupAgentError::NotFound(_)) => return Err(not_found()),
        Err(err) => {
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
        }
    };

    debug!("Streaming backup {} from {}", backup_id, query.agent_id);
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-tar")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", suggested_filename(&backup)),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// POST /api/backup/upload - Receive an archive and copy it to agents
///
/// `agent_id` may repeat; `filename` is optional.
pub async fn upload_backup(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_auth(&headers)?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let agent_ids: Vec<String> = pairs
        .iter()
        .filter(|(key, _)| key == "agent_id")
        .map(|(_, value)| value.clone())
        .collect();
    let filename = pairs
        .into_iter()
        .find(|(key, _)| key == "filename")
        .map(|(_, value)| value);

    let stream: ByteStream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .boxed();
    let agent_errors = state
        .manager
        .receive_backup(&agent_ids, stream, filename)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "agent_errors": agent_errors_json(&agent_errors) })),
    ))
}
