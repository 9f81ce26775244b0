//! Session listing, detail, and deletion. Every operation is scoped to
//! the authenticated user; foreign sessions are 404.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::json;

use super::auth::AuthedUser;
use super::ApiResult;
use crate::state::AppState;

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Json<serde_json::Value> {
    let sessions = state.sessions.list(&user_id);
    Json(json!({
        "sessions": sessions,
        "total": sessions.len(),
    }))
}

pub async fn session_detail(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state.sessions.get(&user_id, &session_id).map_err(|e| {
        // The isolation audit trail: both ids, every denied attempt.
        tracing::info!(
            requester = %user_id,
            session_id = %session_id,
            "session detail refused"
        );
        e
    })?;

    let messages: Vec<serde_json::Value> = record
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "content": m.content,
                "turn_index": m.turn_index,
                "created_at": m.created_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "session_id": record.session_id,
        "title": record.title,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
        "messages": messages,
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.sessions.delete(&user_id, &session_id)?;
    Ok(Json(json!({"ok": true})))
}
