//! WebSocket handler for Axum
//!
//! Handles WebSocket connections, authentication, and event routing.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use edupulse_shared::{PulseError, UserId};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chat::ChatService;
use crate::state::AppState;

use super::{
    connection::Connection,
    events::{ClientEvent, ServerEvent},
};

/// How long an evicted socket gets to flush `session_replaced` and the close frame
const EVICTION_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
/// Authenticates via query parameter token, since browsers cannot set headers on upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, StatusCode> {
    let user_id = authenticate(&app_state, params.token.as_deref())?;

    // Verify user exists in the directory
    match app_state.chat.user_exists(user_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(user_id = %user_id, "WebSocket auth failed: user not found");
            return Err(StatusCode::UNAUTHORIZED);
        }
        Err(e) => {
            tracing::error!(error = %e, "WebSocket auth: directory error");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    tracing::info!(user_id = %user_id, "WebSocket connection upgrade requested");

    let chat = Arc::clone(&app_state.chat);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, chat)))
}

/// Resolve the query-string token to a user id
fn authenticate(app_state: &AppState, token: Option<&str>) -> Result<UserId, StatusCode> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        tracing::warn!("WebSocket auth failed: missing token");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let claims = app_state.jwt.validate_access_token(token).map_err(|e| {
        tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
        StatusCode::UNAUTHORIZED
    })?;
    Ok(UserId(claims.sub))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: UserId, chat: Arc<ChatService>) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn = Arc::new(Connection::new(user_id, tx));
    let connection_id = conn.connection_id;

    // Acknowledge before the first presence snapshot so the client sees them in order
    let _ = conn.send(ServerEvent::Connected {
        connection_id,
        user_id,
    });
    chat.connect(Arc::clone(&conn)).await;

    // Spawn task to send events to client
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let replaced = matches!(event, ServerEvent::SessionReplaced);
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket event");
                }
            }
            if replaced {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "session replaced".into(),
                    })))
                    .await;
                break;
            }
        }
    });

    // Handle incoming messages until the client leaves or a newer session takes over
    let evicted = loop {
        tokio::select! {
            _ = conn.evicted() => break true,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_text(&text, &conn, &chat).await,
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(connection_id = %connection_id, "WebSocket close frame received");
                    break false;
                }
                Some(Ok(_)) => {} // Axum answers pings; binary frames are ignored
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                    break false;
                }
            }
        }
    };

    // Cleanup on disconnect
    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        evicted,
        "WebSocket connection closing"
    );
    chat.disconnect(&conn).await;

    if evicted {
        if tokio::time::timeout(EVICTION_FLUSH_TIMEOUT, &mut send_task)
            .await
            .is_err()
        {
            send_task.abort();
        }
    } else {
        send_task.abort();
    }
}

/// Parse and dispatch one text frame
async fn handle_text(text: &str, conn: &Arc<Connection>, chat: &ChatService) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => handle_client_event(event, conn, chat).await,
        Err(e) => {
            tracing::warn!(
                error = %e,
                connection_id = %conn.connection_id,
                "Failed to parse client event"
            );
            let _ = conn.send(ServerEvent::Error {
                code: "invalid_event".to_string(),
                message: "Invalid event format".to_string(),
            });
        }
    }
}

/// Handle client event
async fn handle_client_event(event: ClientEvent, conn: &Arc<Connection>, chat: &ChatService) {
    use ClientEvent::*;

    match event {
        AnnounceOnline { user_id } => {
            if user_id != conn.user_id {
                reply_error(
                    conn,
                    &PulseError::Auth("cannot announce presence for another user".to_string()),
                );
                return;
            }
            chat.announce_online(conn).await;
        }

        SendMessage(payload) => {
            let message = match payload.validate(conn.user_id) {
                Ok(message) => message,
                Err(e) => {
                    reply_error(conn, &e);
                    return;
                }
            };
            // Success is confirmed by the echoed new_message event
            if let Err(e) = chat.send_message(message).await {
                reply_error(conn, &e);
            }
        }

        GetMessageHistory(request) => {
            let query = match request.validate(conn.user_id) {
                Ok(query) => query,
                Err(e) => {
                    reply_error(conn, &e);
                    return;
                }
            };
            let other_user_id = query.other_user_id;
            match chat.history(query).await {
                Ok(messages) => {
                    let _ = conn.send(ServerEvent::MessageHistory {
                        other_user_id,
                        messages,
                    });
                }
                Err(e) => reply_error(conn, &e),
            }
        }

        Ping => {
            let _ = conn.send(ServerEvent::Pong);
            chat.touch(conn).await;
        }
    }
}

/// Answer the requesting connection only
fn reply_error(conn: &Connection, err: &PulseError) {
    tracing::warn!(
        connection_id = %conn.connection_id,
        user_id = %conn.user_id,
        code = err.code(),
        error = %err,
        "Rejected client event"
    );
    let _ = conn.send(ServerEvent::error(err));
}
