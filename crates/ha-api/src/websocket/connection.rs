//! WebSocket connection handling
//!
//! Manages WebSocket connections, authentication, and message routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use ha_backup::HA_VERSION;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::AppState;

use super::dispatch::handle_message;
use super::types::{
    AuthInvalidMessage, AuthOkMessage, AuthRequiredMessage, IncomingMessage, OutgoingMessage,
};

// =============================================================================
// Connection State
// =============================================================================

/// Per-connection state
pub struct ActiveConnection {
    /// App state reference
    pub state: AppState,
    /// Last message ID received
    last_id: AtomicU64,
    /// Active subscriptions: subscription_id -> cancel sender
    pub subscriptions: RwLock<HashMap<u64, broadcast::Sender<()>>>,
}

impl ActiveConnection {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            last_id: AtomicU64::new(0),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Validate that the message ID is increasing
    pub fn validate_id(&self, id: u64) -> Result<(), &'static str> {
        let last = self.last_id.load(Ordering::SeqCst);
        if id <= last {
            return Err("id_reuse");
        }
        self.last_id.store(id, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Handle a WebSocket connection
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let ha_version = HA_VERSION.to_string();
    let auth_required = OutgoingMessage::AuthRequired(AuthRequiredMessage {
        msg_type: "auth_required",
        ha_version: ha_version.clone(),
    });

    if let Err(e) = send_message(&mut sender, &auth_required).await {
        error!("Failed to send auth_required: {}", e);
        return;
    }

    // Wait for auth message (with timeout)
    let auth_result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        wait_for_auth(&mut receiver),
    )
    .await;

    match auth_result {
        Ok(Ok(true)) => {
            let auth_ok = OutgoingMessage::AuthOk(AuthOkMessage {
                msg_type: "auth_ok",
                ha_version: ha_version.clone(),
            });
            if let Err(e) = send_message(&mut sender, &auth_ok).await {
                error!("Failed to send auth_ok: {}", e);
                return;
            }
            info!("WebSocket client authenticated");
        }
        Ok(Ok(false)) | Ok(Err(_)) => {
            let auth_invalid = OutgoingMessage::AuthInvalid(AuthInvalidMessage {
                msg_type: "auth_invalid",
                message: "Invalid access token or password".to_string(),
            });
            let _ = send_message(&mut sender, &auth_invalid).await;
            warn!("WebSocket client authentication failed");
            return;
        }
        Err(_) => {
            // Timeout
            let auth_invalid = OutgoingMessage::AuthInvalid(AuthInvalidMessage {
                msg_type: "auth_invalid",
                message: "Authentication timeout".to_string(),
            });
            let _ = send_message(&mut sender, &auth_invalid).await;
            warn!("WebSocket client authentication timeout");
            return;
        }
    }

    let conn = Arc::new(ActiveConnection::new(state));

    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(256);

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if send_message(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    // Process incoming messages
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received: {}", text);
                if let Err(e) = handle_message(&conn, &text, &tx).await {
                    error!("Error handling message: {}", e);
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Ok(Message::Ping(data)) => {
                // Pong is handled automatically by axum
                debug!("Received ping: {:?}", data);
            }
            Ok(_) => {
                // Ignore other message types
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup subscriptions
    let subscriptions = conn.subscriptions.read().await;
    for (_, cancel_tx) in subscriptions.iter() {
        let _ = cancel_tx.send(());
    }
    drop(subscriptions);

    // Wait for send task to finish
    send_task.abort();
    info!("WebSocket connection closed");
}

// =============================================================================
// Authentication
// =============================================================================

/// Wait for the auth message; any bearer token or password is accepted
async fn wait_for_auth(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Result<bool, String> {
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(IncomingMessage::Auth {
                    access_token,
                    api_password,
                }) => {
                    let token = access_token.or(api_password).unwrap_or_default();
                    return Ok(!token.trim().is_empty());
                }
                _ => return Err("Expected auth message".to_string()),
            },
            Ok(Message::Close(_)) => {
                return Err("Connection closed".to_string());
            }
            Err(e) => {
                return Err(format!("WebSocket error: {}", e));
            }
            _ => {}
        }
    }
    Err("Connection closed".to_string())
}

/// Send a message to the WebSocket
pub async fn send_message(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &OutgoingMessage,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    debug!("Sending: {}", json);
    sender
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
