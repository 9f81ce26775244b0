//! End-to-end confirmation flow through the scheduler: a gated tool call
//! suspends the turn and releases its worker; the confirmation decision
//! resumes it on the same frame channel.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ag_domain::config::MemoryConfig;
use ag_domain::error::Result;
use ag_domain::stream::{BoxStream, StreamEvent};
use ag_gateway::bus::EventBus;
use ag_gateway::config_service::ConfigService;
use ag_gateway::confirm::ConfirmStore;
use ag_gateway::frames::{Frame, FrameSink};
use ag_gateway::scheduler::{Scheduler, WorkItem, WorkKind};
use ag_gateway::turn::TurnEngine;
use ag_memory::{LocalStore, MemoryService};
use ag_providers::{ChatRequest, ChatResponse, LlmProvider};
use ag_sessions::{DailyLogWriter, SessionStore};
use ag_tools::ToolRunner;

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        unreachable!("streaming only")
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let script = self.scripts.lock().pop_front().unwrap_or_else(|| {
            vec![StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }]
        });
        Ok(Box::pin(futures_util::stream::iter(
            script.into_iter().map(Ok),
        )))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

struct World {
    scheduler: Scheduler,
    sessions: Arc<SessionStore>,
    confirm: Arc<ConfirmStore>,
    _dir: tempfile::TempDir,
}

fn world(scripts: Vec<Vec<StreamEvent>>) -> World {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let config =
        Arc::new(ConfigService::init(&dir.path().join("config"), None, bus.clone()).unwrap());
    let sessions = Arc::new(SessionStore::new(&dir.path().join("state")).unwrap());
    let (memory, _events) = MemoryService::new(MemoryConfig::default(), Arc::new(LocalStore::new()));
    let tools = Arc::new(ToolRunner::builtin(Default::default()));
    let confirm = Arc::new(ConfirmStore::new(Duration::from_secs(300)));
    let logbook = Arc::new(DailyLogWriter::new(dir.path().join("logs")));

    let provider = Arc::new(ScriptedProvider {
        scripts: Mutex::new(scripts.into()),
    });
    let engine = Arc::new(
        TurnEngine::new(
            config,
            sessions.clone(),
            memory,
            tools,
            confirm.clone(),
            logbook,
            bus.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_provider_factory(Box::new(move |_| Ok(provider.clone()))),
    );
    let scheduler = Scheduler::new(Default::default(), engine, bus);

    World {
        scheduler,
        sessions,
        confirm,
        _dir: dir,
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame before timeout")
        .expect("channel open")
}

#[tokio::test]
async fn gated_tool_suspends_then_reject_finishes_on_the_same_stream() {
    let world = world(vec![
        vec![
            StreamEvent::ToolCallStarted {
                call_id: "call_1".into(),
                tool_name: "shell.exec".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "0".into(),
                delta: r#"{"command": "rm -r ./scratch"}"#.into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            },
        ],
        vec![
            StreamEvent::Token {
                text: "Understood, I won't run it.".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            },
        ],
    ]);

    let session = world.sessions.create("u1", None).unwrap();
    let (tx, mut rx) = mpsc::channel::<Frame>(64);

    world
        .scheduler
        .enqueue(WorkItem {
            user_id: "u1".into(),
            session_id: session.session_id.clone(),
            kind: WorkKind::Message {
                text: "clean my scratch dir".into(),
                stream: true,
            },
            frames: FrameSink::new(tx),
            attempt: 0,
        })
        .await
        .unwrap();

    // The stream pauses at the awaiting_confirm tool_start.
    let detected = next_frame(&mut rx).await;
    assert_eq!(detected["type"], "tool_detected");
    let start = next_frame(&mut rx).await;
    assert_eq!(start["type"], "tool_start");
    assert_eq!(start["status"], "awaiting_confirm");
    assert_eq!(start["call_id"], "call_1");

    // The session is parked; the worker is free again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = world.scheduler.stats();
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.parked_sessions, 1);
    assert_eq!(world.confirm.len(), 1);

    // Reject via the same path the HTTP handler uses.
    let pending = world
        .confirm
        .take("call_1", "u1", &session.session_id)
        .unwrap();
    let frames = pending.suspended.frames.clone();
    world
        .scheduler
        .resume(WorkItem {
            user_id: "u1".into(),
            session_id: session.session_id.clone(),
            kind: WorkKind::Resume {
                pending: Arc::new(Mutex::new(Some(pending))),
                approve: false,
            },
            frames,
            attempt: 0,
        })
        .await
        .unwrap();

    // Frames continue on the original channel: synthetic tool result,
    // closing text, done.
    let result = next_frame(&mut rx).await;
    assert_eq!(result["type"], "tool_result");
    assert_eq!(result["result"], "rejected by user");

    let text = next_frame(&mut rx).await;
    assert_eq!(text["type"], "text");

    let done = next_frame(&mut rx).await;
    assert_eq!(done["type"], "done");
    assert_eq!(done["content"], "Understood, I won't run it.");

    // The committed turn holds the rejection, and no side effect ran.
    let record = world.sessions.get("u1", &session.session_id).unwrap();
    assert_eq!(record.messages.len(), 3);
    assert_eq!(record.messages[1].content, "rejected by user");
}

#[tokio::test]
async fn queued_message_waits_for_the_confirmation() {
    let world = world(vec![
        // First turn: gated call.
        vec![
            StreamEvent::ToolCallStarted {
                call_id: "call_1".into(),
                tool_name: "shell.exec".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "0".into(),
                delta: "{}".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: None,
            },
        ],
        // Resume of the first turn.
        vec![
            StreamEvent::Token {
                text: "first done".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: None,
            },
        ],
        // The queued second turn.
        vec![
            StreamEvent::Token {
                text: "second done".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: None,
            },
        ],
    ]);

    let session = world.sessions.create("u1", None).unwrap();
    let (tx1, mut rx1) = mpsc::channel::<Frame>(64);
    let (tx2, mut rx2) = mpsc::channel::<Frame>(64);

    let item = |text: &str, sink: FrameSink| WorkItem {
        user_id: "u1".into(),
        session_id: session.session_id.clone(),
        kind: WorkKind::Message {
            text: text.into(),
            stream: true,
        },
        frames: sink,
        attempt: 0,
    };

    world
        .scheduler
        .enqueue(item("run something", FrameSink::new(tx1)))
        .await
        .unwrap();

    // Wait for suspension, then queue a second message.
    loop {
        if world.confirm.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    world
        .scheduler
        .enqueue(item("next question", FrameSink::new(tx2)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Still parked: the second message has produced nothing.
    assert!(rx2.try_recv().is_err());

    // Approve; first turn completes, then the queued one runs.
    let pending = world
        .confirm
        .take("call_1", "u1", &session.session_id)
        .unwrap();
    let frames = pending.suspended.frames.clone();
    world
        .scheduler
        .resume(WorkItem {
            user_id: "u1".into(),
            session_id: session.session_id.clone(),
            kind: WorkKind::Resume {
                pending: Arc::new(Mutex::new(Some(pending))),
                approve: true,
            },
            frames,
            attempt: 0,
        })
        .await
        .unwrap();

    // First stream finishes.
    loop {
        let frame = next_frame(&mut rx1).await;
        if frame["type"] == "done" {
            assert_eq!(frame["content"], "first done");
            break;
        }
    }
    // Then the queued turn runs to completion in order.
    loop {
        let frame = next_frame(&mut rx2).await;
        if frame["type"] == "done" {
            assert_eq!(frame["content"], "second done");
            break;
        }
    }

    // Both turns committed, in order.
    let record = world.sessions.get("u1", &session.session_id).unwrap();
    let texts: Vec<&str> = record
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    let first_pos = texts.iter().position(|t| *t == "first done").unwrap();
    let second_pos = texts.iter().position(|t| *t == "second done").unwrap();
    assert!(first_pos < second_pos);
}
