//! Chat REST endpoints
//!
//! Read-only views over the same service the WebSocket transport drives.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use edupulse_shared::{MessageId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::chat::{ConversationView, HistoryQuery};
use crate::error::ApiResult;
use crate::state::AppState;
use crate::websocket::events::{ChatContact, EnrichedMessage, OnlineUser};

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
    pub before_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub other_user_id: UserId,
    pub messages: Vec<EnrichedMessage>,
}

/// GET /api/v1/chat/users
///
/// Everyone the caller can message, with online flag and last-seen.
pub async fn chat_users(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ChatContact>>> {
    Ok(Json(state.chat.chat_users(auth_user.user_id).await?))
}

/// GET /api/v1/chat/online-users
pub async fn online_users(State(state): State<AppState>) -> Json<Vec<OnlineUser>> {
    Json(state.chat.online_users().await)
}

/// GET /api/v1/chat/history/:other_user_id
pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(other_user_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<HistoryResponse>> {
    let other_user_id = UserId(other_user_id);
    let messages = state
        .chat
        .history(HistoryQuery {
            user_id: auth_user.user_id,
            other_user_id,
            limit: params.limit,
            before_id: params.before_id.map(MessageId),
        })
        .await?;

    Ok(Json(HistoryResponse {
        other_user_id,
        messages,
    }))
}

/// GET /api/v1/chat/conversations
pub async fn conversations(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ConversationView>>> {
    Ok(Json(state.chat.conversations(auth_user.user_id).await?))
}
