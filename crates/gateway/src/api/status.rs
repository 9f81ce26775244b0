//! Liveness, structured diagnostics, and config self-repair.

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::ApiResult;
use crate::state::AppState;

/// `GET /api/status` — unauthenticated liveness probe.
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "memory_active": state.memory.enabled(),
    }))
}

/// `GET /api/doctor` — one check block per subsystem.
pub async fn doctor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let system = state.config.system_config();
    let config_issues: Vec<String> = system
        .validate()
        .iter()
        .map(ToString::to_string)
        .collect();

    let state_dir = &system.paths.state_dir;
    let state_dir_writable = std::fs::metadata(state_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);

    let api = &system.api;
    let memory_check = if state.memory.enabled() {
        let reachable = tokio::time::timeout(Duration::from_secs(1), state.memory.ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        json!({"enabled": true, "reachable": reachable, "ingest_dropped": state.memory.ingest_dropped_total()})
    } else {
        json!({"enabled": false})
    };

    let oldest_open_turn_secs = state
        .sessions
        .oldest_open_turn_age()
        .map(|age| age.num_seconds());

    // Recent failures from the bus history ring, most recent last.
    let recent_errors: Vec<serde_json::Value> = state
        .bus
        .history(200)
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                crate::bus::EventKind::ConversationError | crate::bus::EventKind::ToolCallError
            )
        })
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .take(10)
        .rev()
        .map(|e| e.to_json())
        .collect();

    Json(json!({
        "checks": {
            "config": {
                "ok": config_issues.is_empty(),
                "issues": config_issues,
            },
            "state_dir": {
                "ok": state_dir_writable,
                "path": state_dir.display().to_string(),
            },
            "provider": {
                "ok": !api.api_key.is_empty(),
                "base_url": api.base_url,
                "model": api.model,
            },
            "memory": memory_check,
            "bus": state.bus.stats(),
            "scheduler": state.scheduler.stats(),
            "connections": state.connections.count(),
            "pending_confirmations": state.confirm.len(),
            "oldest_open_turn_secs": oldest_open_turn_secs,
            "recent_errors": recent_errors,
        }
    }))
}

/// `POST /api/doctor/migrate-config` — back up and reset user config files
/// that no longer parse.
pub async fn migrate_config(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let (checked, repaired, backups) = state.config.migrate_user_configs()?;
    Ok(Json(json!({
        "status": if repaired == 0 { "clean" } else { "repaired" },
        "checked": checked,
        "repaired": repaired,
        "backup": backups,
    })))
}
