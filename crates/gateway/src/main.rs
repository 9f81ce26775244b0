use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use ag_gateway::api;
use ag_gateway::bus::{EventBus, EventKind};
use ag_gateway::config_service::ConfigService;
use ag_gateway::confirm::ConfirmStore;
use ag_gateway::connections::ConnectionRegistry;
use ag_gateway::scheduler::{Scheduler, WorkItem, WorkKind};
use ag_gateway::state::AppState;
use ag_gateway::turn::TurnEngine;
use ag_memory::{LocalStore, MemoryEvent, MemoryService, Neo4jStore};
use ag_sessions::{DailyLogWriter, SessionStore, UserStore};
use ag_tools::ToolRunner;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ag_gateway=debug")),
        )
        .json()
        .init();

    tracing::info!("agentgate starting");

    let (state, listener, cancelled) = match startup().await {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    let drain = Duration::from_secs(state.config.system_config().server.drain_timeout_secs);
    let scheduler = state.scheduler.clone();

    let app = api::router(state).layer(tower_http::cors::CorsLayer::permissive());
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = serve_result {
        tracing::error!(error = %e, "server error");
        std::process::exit(2);
    }

    // Drain in-flight turns, then abort whatever is left.
    tracing::info!(drain_secs = drain.as_secs(), "draining in-flight turns");
    if !scheduler.shutdown(drain).await {
        tracing::warn!("drain deadline reached, aborting remaining turns");
        cancelled.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    tracing::info!("agentgate stopped");
}

type Prepared = (AppState, tokio::net::TcpListener, Arc<AtomicBool>);

async fn startup() -> anyhow::Result<Prepared> {
    // ── Config ───────────────────────────────────────────────────────
    let config_path = config_path_from_args();
    let bus = EventBus::new();
    let config = Arc::new(
        ConfigService::init(
            &default_config_dir(),
            config_path.as_deref(),
            bus.clone(),
        )
        .context("loading configuration")?,
    );

    let issues = config.system_config().validate();
    for issue in &issues {
        tracing::warn!(%issue, "config issue");
    }
    if ag_domain::config::Config::has_errors(&issues) {
        anyhow::bail!("configuration has fatal errors");
    }
    let system = config.system_config();

    // ── Stores ───────────────────────────────────────────────────────
    let users = Arc::new(
        UserStore::new(&system.paths.state_dir, system.sessions.token_ttl_days)
            .context("initializing user store")?,
    );
    let sessions = Arc::new(
        SessionStore::new(&system.paths.state_dir).context("initializing session store")?,
    );
    let logbook = Arc::new(DailyLogWriter::new(system.paths.log_dir.clone()));

    // ── Memory ───────────────────────────────────────────────────────
    let store: Arc<dyn ag_memory::GraphMemoryStore> =
        if system.memory.enabled && system.memory.neo4j.enabled {
            tracing::info!(uri = %system.memory.neo4j.uri, "memory backed by neo4j");
            Arc::new(Neo4jStore::new(&system.memory.neo4j).context("creating neo4j client")?)
        } else {
            Arc::new(LocalStore::new())
        };
    let (memory, memory_events) = MemoryService::new(system.memory.clone(), store);
    if memory.enabled() {
        tracing::info!("memory service enabled");
    }

    // ── Tools ────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRunner::builtin(system.tools.exec.clone()));

    // ── Runtime ──────────────────────────────────────────────────────
    let connections = Arc::new(ConnectionRegistry::new(bus.clone()));
    let confirm = Arc::new(ConfirmStore::new(Duration::from_secs(
        system.tools.confirm_ttl_secs,
    )));
    let cancelled = Arc::new(AtomicBool::new(false));

    let engine = Arc::new(TurnEngine::new(
        config.clone(),
        sessions.clone(),
        memory.clone(),
        tools.clone(),
        confirm.clone(),
        logbook,
        bus.clone(),
        cancelled.clone(),
    ));
    let scheduler = Scheduler::new(system.scheduler.clone(), engine, bus.clone());

    let state = AppState {
        config,
        users,
        sessions: sessions.clone(),
        memory: memory.clone(),
        tools,
        bus: bus.clone(),
        connections,
        scheduler: scheduler.clone(),
        confirm: confirm.clone(),
        rate_limiter: Arc::new(api::ratelimit::RateLimiter::new(&system.server.rate_limit)),
        started_at: chrono::Utc::now(),
    };

    spawn_memory_event_bridge(bus.clone(), memory_events);
    spawn_housekeeping(state.clone(), system.scheduler.sweep_interval_secs);
    if memory.enabled() {
        spawn_maintenance_tick(memory.clone());
    }

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", system.server.host, system.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agentgate listening");

    Ok((state, listener, cancelled))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Re-emit memory service notifications onto the event bus.
fn spawn_memory_event_bridge(
    bus: EventBus,
    mut events: tokio::sync::mpsc::Receiver<MemoryEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MemoryEvent::Saved { user_id, facts } => bus.emit(
                    EventKind::MemorySaved,
                    serde_json::json!({"user_id": user_id, "facts": facts}),
                ),
                MemoryEvent::Recalled { user_id, snippets } => bus.emit(
                    EventKind::MemoryRecalled,
                    serde_json::json!({"user_id": user_id, "snippets": snippets}),
                ),
                MemoryEvent::ClusterDone { user_id, formed } => bus.emit(
                    EventKind::MemoryClusterDone,
                    serde_json::json!({"user_id": user_id, "formed": formed}),
                ),
                MemoryEvent::SummaryDone { user_id, written } => bus.emit(
                    EventKind::MemorySummaryDone,
                    serde_json::json!({"user_id": user_id, "written": written}),
                ),
            }
        }
    });
}

/// Periodic sweep: expired confirmations become rejects, empty scheduler
/// entries and drained rate-limit buckets go away, idle sessions age out.
fn spawn_housekeeping(state: AppState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;

            for pending in state.confirm.take_expired() {
                tracing::info!(
                    user_id = %pending.user_id,
                    session_id = %pending.session_id,
                    call_id = %pending.call_id,
                    "confirmation expired, rejecting"
                );
                let frames = pending.suspended.frames.clone();
                let item = WorkItem {
                    user_id: pending.user_id.clone(),
                    session_id: pending.session_id.clone(),
                    kind: WorkKind::Resume {
                        pending: Arc::new(parking_lot::Mutex::new(Some(pending))),
                        approve: false,
                    },
                    frames,
                    attempt: 0,
                };
                if let Err(e) = state.scheduler.resume(item).await {
                    tracing::warn!(error = %e, "failed to resume expired confirmation");
                }
            }

            state.scheduler.sweep_idle();
            state.rate_limiter.sweep();

            let idle_hours = state.config.system_config().sessions.idle_cleanup_hours;
            if let Err(e) = state.sessions.cleanup_idle(idle_hours) {
                tracing::warn!(error = %e, "session cleanup failed");
            }
        }
    });
}

/// The cluster → summarize → decay tick.
fn spawn_maintenance_tick(memory: Arc<MemoryService>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(memory.maintain_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            match memory.maintain(None).await {
                Ok(report) => tracing::info!(
                    users = report.users,
                    clustered = report.clustered,
                    summarized = report.summarized,
                    decayed = report.decayed,
                    removed = report.removed,
                    "memory maintenance pass"
                ),
                Err(e) => tracing::warn!(error = %e, "memory maintenance failed"),
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `--config <path>` flag, then `AGENTGATE_CONFIG`, else the default
/// `config/default.json`.
fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("AGENTGATE_CONFIG").ok().map(PathBuf::from)
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
