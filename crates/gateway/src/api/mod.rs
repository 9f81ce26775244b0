//! HTTP surface: routes, middleware, error normalization.
//!
//! Middleware order (outermost first): request id → request logging →
//! auth resolution → per-user rate limit. Every handler error funnels
//! through [`ApiError`], which maps the shared taxonomy onto status codes;
//! cross-tenant access surfaces as 404, indistinguishable from absence.

pub mod auth;
pub mod chat;
pub mod config;
pub mod memory;
pub mod ratelimit;
pub mod sessions;
pub mod status;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use ag_domain::error::Error;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wrapper turning domain errors into JSON error responses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Busy(_) | Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            Error::ToolDenied(_) => StatusCode::FORBIDDEN,
            Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Client-facing message: short and free of internals for 5xx.
        let message = if status.is_server_error() {
            self.0.user_message()
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(serde_json::json!({
                "error": message,
                "code": self.0.kind(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request-id + logging middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let started = std::time::Instant::now();
    let mut response = next.run(req).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        request_id = %request_id,
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms,
        "http request"
    );

    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the full API router. Public routes skip auth; everything else is
/// behind bearer-token resolution and the per-user rate limit.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/status", get(status::status));

    let protected = Router::new()
        // Chat (core runtime)
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/confirm", post(chat::confirm))
        .route("/api/followup", post(chat::followup))
        // Sessions
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:id", get(sessions::session_detail))
        .route("/api/sessions/:id", delete(sessions::delete_session))
        // Config
        .route("/api/config", get(config::get_config))
        .route("/api/config", post(config::update_config))
        .route("/api/config/update", post(config::update_config))
        .route("/api/config/reset", post(config::reset_config))
        // Account
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/user/profile", get(auth::profile))
        .route("/api/user/config", post(auth::update_profile))
        .route("/api/user/delete", post(auth::delete_account))
        // Memory
        .route("/api/memory/graph/:session_id", get(memory::graph))
        .route("/api/memory/:op/:session_id", post(memory::maintenance))
        // Diagnostics
        .route("/api/doctor", get(status::doctor))
        .route("/api/doctor/migrate-config", post(status::migrate_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::enforce,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::resolve));

    public
        .merge(protected)
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}
