//! Per-user leaky-bucket rate limiting.
//!
//! Each user has a bucket that drains at `leak_per_sec` and holds at most
//! `capacity` requests. A request past capacity is 429 with the shared
//! `rate_limited` code. Buckets are lazy; an idle user costs nothing.

use std::collections::HashMap;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;

use ag_domain::config::RateLimitConfig;
use ag_domain::error::Error;

use super::auth::AuthedUser;
use super::ApiError;
use crate::state::AppState;

struct Bucket {
    level: f64,
    last: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    leak_per_sec: f64,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: f64::from(cfg.capacity.max(1)),
            leak_per_sec: cfg.leak_per_sec.max(0.1),
        }
    }

    /// Account one request for `user_id`; `false` means over the limit.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            level: 0.0,
            last: now,
        });

        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.level = (bucket.level - elapsed * self.leak_per_sec).max(0.0);
        bucket.last = now;

        if bucket.level + 1.0 > self.capacity {
            return false;
        }
        bucket.level += 1.0;
        true
    }

    /// Drop buckets that have fully drained (periodic sweep).
    pub fn sweep(&self) {
        let now = Instant::now();
        let leak = self.leak_per_sec;
        self.buckets.lock().retain(|_, b| {
            let drained = b.level - now.duration_since(b.last).as_secs_f64() * leak;
            drained > 0.0
        });
    }
}

/// Middleware: runs after auth, so the user id is known.
pub async fn enforce(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let user_id = req
        .extensions()
        .get::<AuthedUser>()
        .map(|u| u.0.clone())
        .unwrap_or_default();

    if !state.rate_limiter.allow(&user_id) {
        tracing::warn!(user_id = %user_id, "rate limit exceeded");
        return ApiError(Error::RateLimited {
            message: "too many requests".into(),
            retry_after: None,
        })
        .into_response();
    }
    next.run(req).await
}
