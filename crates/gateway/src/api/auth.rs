//! Authentication routes and the bearer-token middleware.
//!
//! The core trusts only `token → user_id` resolution; tokens are opaque
//! strings minted by the user store. The middleware rejects with 401 on a
//! missing or stale token and inserts [`AuthedUser`] for handlers.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use ag_domain::error::Error;

use super::{ApiError, ApiResult};
use crate::state::AppState;

/// The authenticated user id, inserted by [`resolve`].
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn resolve(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let Some(user_id) = state.users.resolve_token(token) else {
        return ApiError(Error::Unauthorized("missing or invalid token".into()))
            .into_response();
    };

    req.extensions_mut().insert(AuthedUser(user_id));
    next.run(req).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub agent_name: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (user, token) =
        state
            .users
            .register(&body.username, &body.password, body.agent_name.as_deref())?;

    // A chosen agent name becomes the user's config overlay so the persona
    // applies from the first turn.
    if let Some(name) = body.agent_name.as_deref().filter(|n| !n.trim().is_empty()) {
        state
            .config
            .update_user(&user.user_id, &json!({"agent_name": name.trim()}))?;
    }

    Ok(Json(json!({
        "user_id": user.user_id,
        "token": token,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (user, token) = state.users.login(&body.username, &body.password)?;
    let snapshot = state.config.for_user(&user.user_id);

    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "user_id": user.user_id,
        "username": user.username,
        "agent_name": snapshot.agent_name,
        "api_key_configured": !snapshot.config.api.api_key.is_empty(),
    })))
}

pub async fn logout(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Json<serde_json::Value> {
    if let Some(token) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        state.users.revoke_token(token);
    }
    Json(json!({"ok": true}))
}

pub async fn profile(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .users
        .get(&user_id)
        .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
    let snapshot = state.config.for_user(&user_id);

    Ok(Json(json!({
        "user_id": user.user_id,
        "username": user.username,
        "agent_name": snapshot.agent_name,
        "system_prompt": snapshot.system_prompt,
        "api_key_configured": !snapshot.config.api.api_key.is_empty(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<ProfileUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut patch = serde_json::Map::new();
    if let Some(name) = body.agent_name {
        patch.insert("agent_name".into(), json!(name));
    }
    if let Some(prompt) = body.system_prompt {
        patch.insert("system_prompt".into(), json!(prompt));
    }
    if patch.is_empty() {
        return Err(Error::InvalidArguments("nothing to update".into()).into());
    }

    state
        .config
        .update_user(&user_id, &serde_json::Value::Object(patch))?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    #[serde(default)]
    pub confirm: bool,
}

/// Destroy the account: sessions, memory, config overlay, then the user
/// record itself. Memory failures are logged, not fatal — the graph store
/// may be down while the account still must go.
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<DeleteAccountRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !body.confirm {
        return Err(Error::InvalidArguments("confirm must be true".into()).into());
    }

    let removed_sessions = state.sessions.delete_all_for_user(&user_id)?;
    if let Err(e) = state.memory.delete_user(&user_id).await {
        tracing::warn!(user_id = %user_id, error = %e, "memory cleanup failed during account deletion");
    }
    state.config.purge_user(&user_id);
    state.users.delete_user(&user_id)?;

    tracing::info!(user_id = %user_id, removed_sessions, "account deleted");
    Ok(Json(json!({"ok": true, "removed_sessions": removed_sessions})))
}
