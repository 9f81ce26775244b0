//! Per-session work scheduling.
//!
//! Serialization model: across sessions, turns run in parallel on a
//! bounded worker pool; within a session, work is strictly FIFO with
//! session affinity — a worker drains its session's queue before moving
//! on. Retriable failures (rate limits, upstream outages) retry in place
//! with jittered exponential backoff, so the item effectively stays at the
//! head of its queue. A turn suspended for confirmation parks the whole
//! session: its worker is released and queued items wait until the
//! confirmation resolves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ag_domain::config::SchedulerConfig;
use ag_domain::error::{Error, Result};

use crate::bus::{EventBus, EventKind};
use crate::confirm::PendingConfirmation;
use crate::frames::{self, FrameSink};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Work items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub enum WorkKind {
    /// A fresh user message starting (or continuing) a session.
    Message { text: String, stream: bool },
    /// Continuation of a suspended turn after a confirmation decision.
    /// The pending state is claimable exactly once.
    Resume {
        pending: Arc<Mutex<Option<PendingConfirmation>>>,
        approve: bool,
    },
}

#[derive(Clone)]
pub struct WorkItem {
    pub user_id: String,
    pub session_id: String,
    pub kind: WorkKind,
    pub frames: FrameSink,
    /// Retry attempt this execution is on (0 = first try).
    pub attempt: u32,
}

/// Terminal states of one executed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Committed,
    Suspended,
    Aborted,
    Failed,
}

/// The turn engine behind the scheduler. `Err` means the attempt produced
/// no user-visible output and may be retried if the error is retriable;
/// user-visible failures are handled inside the runner and come back as
/// `Ok(Failed)`.
#[async_trait::async_trait]
pub trait TurnRunner: Send + Sync + 'static {
    async fn run(&self, item: WorkItem) -> Result<TurnOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct SessionState {
    queue: VecDeque<WorkItem>,
    in_flight: bool,
    parked: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: SchedulerConfig,
    workers: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, SessionState>>,
    runner: Arc<dyn TurnRunner>,
    bus: EventBus,
    shutting_down: AtomicBool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub active_sessions: usize,
    pub parked_sessions: usize,
    pub queued_items: usize,
    pub available_workers: usize,
}

fn session_key(user_id: &str, session_id: &str) -> String {
    format!("{user_id}::{session_id}")
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, runner: Arc<dyn TurnRunner>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                workers: Arc::new(Semaphore::new(cfg.workers)),
                cfg,
                sessions: Mutex::new(HashMap::new()),
                runner,
                bus,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Submit a work item. Returns `Busy` when the session queue is full
    /// or no worker frees up within the configured bound.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::Relaxed) {
            return Err(Error::Cancelled("shutting down".into()));
        }

        let key = session_key(&item.user_id, &item.session_id);

        // Session already active or parked: append, never consume a worker.
        {
            let mut sessions = self.inner.sessions.lock();
            if let Some(state) = sessions.get_mut(&key) {
                if state.in_flight || state.parked {
                    return push_bounded(state, item, self.inner.cfg.queue_depth);
                }
            }
        }

        // Idle session: a worker is required up-front.
        let permit = self.acquire_worker().await?;

        let item = {
            let mut sessions = self.inner.sessions.lock();
            let state = sessions.entry(key.clone()).or_default();
            if state.in_flight || state.parked {
                // Raced with another enqueue that started the session.
                return push_bounded(state, item, self.inner.cfg.queue_depth);
            }
            state.in_flight = true;
            item
        };

        self.spawn_runner(key, item, permit);
        Ok(())
    }

    /// Re-enqueue a suspended turn at the head of its session queue and
    /// unpark the session. Resume items wait for a worker without a bound:
    /// the turn already holds an open transaction and must reach commit or
    /// abort.
    pub async fn resume(&self, item: WorkItem) -> Result<()> {
        let key = session_key(&item.user_id, &item.session_id);

        {
            let mut sessions = self.inner.sessions.lock();
            let state = sessions.entry(key.clone()).or_default();
            state.parked = false;
            state.queue.push_front(item);
            if state.in_flight {
                return Ok(());
            }
        }

        let permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled("worker pool closed".into()))?;

        let next = {
            let mut sessions = self.inner.sessions.lock();
            let state = sessions.entry(key.clone()).or_default();
            if state.in_flight {
                None
            } else {
                match state.queue.pop_front() {
                    Some(item) => {
                        state.in_flight = true;
                        Some(item)
                    }
                    None => None,
                }
            }
        };

        if let Some(item) = next {
            self.spawn_runner(key, item, permit);
        }
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let sessions = self.inner.sessions.lock();
        SchedulerStats {
            active_sessions: sessions.values().filter(|s| s.in_flight).count(),
            parked_sessions: sessions.values().filter(|s| s.parked).count(),
            queued_items: sessions.values().map(|s| s.queue.len()).sum(),
            available_workers: self.inner.workers.available_permits(),
        }
    }

    /// Drop session entries that hold nothing. Called by the periodic
    /// sweep.
    pub fn sweep_idle(&self) {
        let mut sessions = self.inner.sessions.lock();
        sessions.retain(|_, s| s.in_flight || s.parked || !s.queue.is_empty());
    }

    /// Refuse new work and wait for in-flight turns up to `deadline`.
    /// Returns `true` when everything drained.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
        let drained = tokio::time::timeout(deadline, async {
            loop {
                let idle = {
                    let sessions = self.inner.sessions.lock();
                    sessions.values().all(|s| !s.in_flight)
                };
                if idle {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();
        drained
    }

    // ── internals ────────────────────────────────────────────────────

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        let bound = Duration::from_millis(self.inner.cfg.acquire_timeout_ms);
        match tokio::time::timeout(bound, self.inner.workers.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Cancelled("worker pool closed".into())),
            Err(_) => Err(Error::Busy("worker pool saturated".into())),
        }
    }

    fn spawn_runner(&self, key: String, item: WorkItem, permit: OwnedSemaphorePermit) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_session(inner, key, item, permit).await;
        });
    }
}

fn push_bounded(state: &mut SessionState, item: WorkItem, depth: usize) -> Result<()> {
    if state.queue.len() >= depth {
        return Err(Error::Busy("session queue is full".into()));
    }
    state.queue.push_back(item);
    Ok(())
}

/// One worker's session-affine drain loop.
async fn run_session(
    inner: Arc<SchedulerInner>,
    key: String,
    mut item: WorkItem,
    permit: OwnedSemaphorePermit,
) {
    loop {
        let outcome = run_with_retries(&inner, &item).await;

        let next = {
            let mut sessions = inner.sessions.lock();
            let Some(state) = sessions.get_mut(&key) else {
                break;
            };
            if outcome == TurnOutcome::Suspended {
                // Park: release the worker, keep queued items waiting for
                // the confirmation to resolve.
                state.in_flight = false;
                state.parked = true;
                None
            } else {
                match state.queue.pop_front() {
                    Some(next) => Some(next),
                    None => {
                        state.in_flight = false;
                        if !state.parked {
                            sessions.remove(&key);
                        }
                        None
                    }
                }
            }
        };

        match next {
            Some(next_item) => item = next_item,
            None => break,
        }
    }
    drop(permit);
}

/// Execute one item, retrying retriable failures with backoff. All failure
/// surfacing happens here, exactly once per item.
async fn run_with_retries(inner: &Arc<SchedulerInner>, item: &WorkItem) -> TurnOutcome {
    let mut attempt: u32 = 0;
    loop {
        let mut this_attempt = item.clone();
        this_attempt.attempt = attempt;

        match inner.runner.run(this_attempt).await {
            Ok(outcome) => return outcome,
            Err(e) if e.is_retriable() && attempt < inner.cfg.max_retries => {
                let delay = retry_delay(&e, attempt, inner.cfg.retry_base_ms);
                tracing::warn!(
                    user_id = %item.user_id,
                    session_id = %item.session_id,
                    attempt,
                    kind = e.kind(),
                    delay_ms = delay.as_millis() as u64,
                    "retriable turn failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    user_id = %item.user_id,
                    session_id = %item.session_id,
                    attempt,
                    kind = e.kind(),
                    error = %e,
                    "turn failed"
                );
                inner.bus.emit(
                    EventKind::ConversationError,
                    json!({
                        "user_id": item.user_id,
                        "session_id": item.session_id,
                        "kind": e.kind(),
                    }),
                );
                item.frames.send(frames::error(&e.user_message())).await;
                return TurnOutcome::Failed;
            }
        }
    }
}

/// Exponential backoff with deterministic jitter; an upstream `Retry-After`
/// wins outright.
fn retry_delay(error: &Error, attempt: u32, base_ms: u64) -> Duration {
    if let Error::RateLimited {
        retry_after: Some(after),
        ..
    } = error
    {
        return *after;
    }
    let base = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = (base / 4) as f64 * pseudo_random_fraction(attempt);
    Duration::from_millis(base + jitter as u64)
}

/// Cheap deterministic fraction in [0, 1) — enough to spread retry storms
/// without threading an RNG through the hot path.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_add(1).wrapping_mul(2654435761);
    f64::from(hash) / f64::from(u32::MAX)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Runner that records execution order and can fail or suspend on cue.
    struct ScriptedRunner {
        log: Mutex<Vec<String>>,
        fail_first_n: AtomicU32,
        delay: Duration,
        suspend_on: Option<String>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                fail_first_n: AtomicU32::new(0),
                delay: Duration::from_millis(10),
                suspend_on: None,
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl TurnRunner for ScriptedRunner {
        async fn run(&self, item: WorkItem) -> Result<TurnOutcome> {
            let text = match &item.kind {
                WorkKind::Message { text, .. } => text.clone(),
                WorkKind::Resume { .. } => "resume".into(),
            };

            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::RateLimited {
                    message: "429".into(),
                    retry_after: Some(Duration::from_millis(5)),
                });
            }

            tokio::time::sleep(self.delay).await;
            self.log.lock().push(format!("{}:{}", item.session_id, text));

            if self.suspend_on.as_deref() == Some(text.as_str()) {
                return Ok(TurnOutcome::Suspended);
            }
            Ok(TurnOutcome::Committed)
        }
    }

    fn item(user: &str, session: &str, text: &str) -> WorkItem {
        WorkItem {
            user_id: user.into(),
            session_id: session.into(),
            kind: WorkKind::Message {
                text: text.into(),
                stream: false,
            },
            frames: FrameSink::null(),
            attempt: 0,
        }
    }

    fn scheduler_with(runner: Arc<ScriptedRunner>, cfg: SchedulerConfig) -> Scheduler {
        Scheduler::new(cfg, runner, EventBus::new())
    }

    async fn wait_idle(scheduler: &Scheduler) {
        for _ in 0..200 {
            let stats = scheduler.stats();
            if stats.active_sessions == 0 && stats.queued_items == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler did not go idle");
    }

    #[tokio::test]
    async fn same_session_runs_in_fifo_order() {
        let runner = Arc::new(ScriptedRunner::new());
        let scheduler = scheduler_with(runner.clone(), SchedulerConfig::default());

        for i in 0..5 {
            scheduler.enqueue(item("u1", "s1", &format!("m{i}"))).await.unwrap();
        }
        wait_idle(&scheduler).await;

        let log = runner.log();
        assert_eq!(log, vec!["s1:m0", "s1:m1", "s1:m2", "s1:m3", "s1:m4"]);
    }

    #[tokio::test]
    async fn queue_overflow_is_busy() {
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_millis(200),
            ..ScriptedRunner::new()
        });
        let cfg = SchedulerConfig {
            queue_depth: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(runner, cfg);

        scheduler.enqueue(item("u1", "s1", "running")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.enqueue(item("u1", "s1", "q1")).await.unwrap();
        scheduler.enqueue(item("u1", "s1", "q2")).await.unwrap();

        let err = scheduler.enqueue(item("u1", "s1", "q3")).await.unwrap_err();
        assert_eq!(err.kind(), "busy");
    }

    #[tokio::test]
    async fn saturated_pool_rejects_new_sessions() {
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_millis(500),
            ..ScriptedRunner::new()
        });
        let cfg = SchedulerConfig {
            workers: 1,
            acquire_timeout_ms: 30,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(runner, cfg);

        scheduler.enqueue(item("u1", "s1", "long")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A different session needs a worker and cannot get one in time.
        let err = scheduler.enqueue(item("u2", "s2", "blocked")).await.unwrap_err();
        assert_eq!(err.kind(), "busy");

        // But the active session still accepts queued work.
        scheduler.enqueue(item("u1", "s1", "queued")).await.unwrap();
    }

    #[tokio::test]
    async fn sessions_run_in_parallel() {
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_millis(100),
            ..ScriptedRunner::new()
        });
        let scheduler = scheduler_with(runner.clone(), SchedulerConfig::default());

        let start = std::time::Instant::now();
        scheduler.enqueue(item("u1", "s1", "a")).await.unwrap();
        scheduler.enqueue(item("u2", "s2", "b")).await.unwrap();
        wait_idle(&scheduler).await;

        // Serial execution would need ~200ms.
        assert!(start.elapsed() < Duration::from_millis(180));
        assert_eq!(runner.log().len(), 2);
    }

    #[tokio::test]
    async fn retriable_failures_retry_then_succeed() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_first_n.store(2, Ordering::SeqCst);
        let scheduler = scheduler_with(runner.clone(), SchedulerConfig::default());

        scheduler.enqueue(item("u1", "s1", "flaky")).await.unwrap();
        wait_idle(&scheduler).await;

        assert_eq!(runner.log(), vec!["s1:flaky"]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_first_n.store(100, Ordering::SeqCst);
        let cfg = SchedulerConfig {
            max_retries: 2,
            retry_base_ms: 1,
            ..SchedulerConfig::default()
        };
        let bus = EventBus::new();
        let mut events = bus.raw_subscribe();
        let scheduler = Scheduler::new(cfg, runner.clone(), bus);

        scheduler.enqueue(item("u1", "s1", "doomed")).await.unwrap();
        wait_idle(&scheduler).await;

        // Never succeeded, and exactly one conversation.error was emitted.
        assert!(runner.log().is_empty());
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ConversationError);
        assert_eq!(event.payload["kind"], "rate_limited");
        // 1 initial + 2 retries consumed.
        assert_eq!(runner.fail_first_n.load(Ordering::SeqCst), 97);
    }

    #[tokio::test]
    async fn suspension_parks_the_session_until_resume() {
        let runner = Arc::new(ScriptedRunner {
            suspend_on: Some("needs-confirm".into()),
            ..ScriptedRunner::new()
        });
        let scheduler = scheduler_with(runner.clone(), SchedulerConfig::default());

        scheduler.enqueue(item("u1", "s1", "needs-confirm")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queued work does not run while parked.
        scheduler.enqueue(item("u1", "s1", "after")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.log(), vec!["s1:needs-confirm"]);
        assert_eq!(scheduler.stats().parked_sessions, 1);

        // Resume unparks, runs the resume item first, then the queue.
        let resume = WorkItem {
            user_id: "u1".into(),
            session_id: "s1".into(),
            kind: WorkKind::Resume {
                pending: Arc::new(Mutex::new(None)),
                approve: true,
            },
            frames: FrameSink::null(),
            attempt: 0,
        };
        scheduler.resume(resume).await.unwrap();
        wait_idle(&scheduler).await;

        assert_eq!(
            runner.log(),
            vec!["s1:needs-confirm", "s1:resume", "s1:after"]
        );
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let runner = Arc::new(ScriptedRunner::new());
        let scheduler = scheduler_with(runner, SchedulerConfig::default());

        assert!(scheduler.shutdown(Duration::from_millis(100)).await);
        let err = scheduler.enqueue(item("u1", "s1", "late")).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
