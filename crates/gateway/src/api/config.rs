//! Per-user configuration endpoints. Reads return the redacted snapshot;
//! writes deep-merge a patch, rejecting secret-typed fields outright.

use axum::extract::State;
use axum::{Extension, Json};
use serde_json::json;

use super::auth::AuthedUser;
use super::ApiResult;
use crate::state::AppState;

pub async fn get_config(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Json<serde_json::Value> {
    let snapshot = state.config.for_user(&user_id);
    Json(json!({"config": snapshot.public_json()}))
}

pub async fn update_config(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    // Accept both `{config: {...}}` and a bare patch object.
    let patch = body.get("config").unwrap_or(&body);
    let snapshot = state.config.update_user(&user_id, patch)?;
    Ok(Json(json!({"config": snapshot.public_json()})))
}

pub async fn reset_config(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> ApiResult<Json<serde_json::Value>> {
    state.config.reset_user(&user_id)?;
    Ok(Json(json!({"ok": true})))
}
