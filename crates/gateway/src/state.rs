//! Shared application state, built once in `main` and threaded into every
//! handler. There are no ambient globals in this codebase.

use std::sync::Arc;

use ag_memory::MemoryService;
use ag_sessions::{SessionStore, UserStore};
use ag_tools::ToolRunner;

use crate::api::ratelimit::RateLimiter;
use crate::bus::EventBus;
use crate::config_service::ConfigService;
use crate::confirm::ConfirmStore;
use crate::connections::ConnectionRegistry;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigService>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub memory: Arc<MemoryService>,
    pub tools: Arc<ToolRunner>,
    pub bus: EventBus,
    pub connections: Arc<ConnectionRegistry>,
    pub scheduler: Scheduler,
    pub confirm: Arc<ConfirmStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}
