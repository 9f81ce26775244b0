//! Memory surface: the session graph view and on-demand maintenance.
//! Session ownership is checked against the session store before any
//! store query runs.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::json;

use ag_memory::MaintenanceOp;

use super::auth::AuthedUser;
use super::ApiResult;
use crate::state::AppState;

pub async fn graph(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // NotFound for absent and foreign sessions alike.
    state.sessions.get(&user_id, &session_id)?;

    if !state.memory.enabled() {
        return Ok(Json(json!({
            "session_id": session_id,
            "nodes": [],
            "edges": [],
            "stats": {"total_nodes": 0, "total_edges": 0},
        })));
    }

    let view = state.memory.graph_view(&user_id, &session_id).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "nodes": view.nodes,
        "edges": view.edges,
        "stats": {
            "total_nodes": view.nodes.len(),
            "total_edges": view.edges.len(),
        },
    })))
}

pub async fn maintenance(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path((op, session_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let op: MaintenanceOp = op.parse()?;
    state.sessions.get(&user_id, &session_id)?;

    let report = state.memory.run_op(op, &user_id).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "user_id": user_id,
        "result": report,
    })))
}
