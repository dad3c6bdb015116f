//! End-to-end scenarios driven by a scripted fake provider and fake tools.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use spindle_domain::{
    AgentEvent, Completion, CompletionRequest, Config, Message, Provider, ProviderError, Result,
    Role, Source, TextDeltaSink, ToolCall, ToolDefinition, ToolOutput, Usage,
};
use spindle_runtime::{
    Agent, EventSink, RunEndStatus, RunState, ToolContext, ToolHandler, SKIPPED_TOOL_RESULT,
    TOOL_ERROR_PREFIX,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
enum Reply {
    Text(&'static str),
    Calls(&'static str, Vec<ToolCall>),
    Transient,
    Fatal,
}

struct FakeProvider {
    script: Mutex<VecDeque<Reply>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    last_history: Mutex<Vec<Message>>,
}

impl FakeProvider {
    fn new(script: Vec<Reply>) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    fn with_delay(script: Vec<Reply>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            last_history: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for FakeProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        stream: Option<TextDeltaSink>,
    ) -> std::result::Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.last_history.lock() = request.messages.clone();
        let reply = self.script.lock().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(Reply::Text(text)) => {
                if let Some(sink) = &stream {
                    for chunk in text.split_inclusive(' ') {
                        sink(chunk);
                    }
                }
                Ok(Completion {
                    message: Message::assistant(text),
                    usage: Some(Usage {
                        input_tokens: 7,
                        output_tokens: 3,
                        total_tokens: 10,
                        ..Default::default()
                    }),
                })
            }
            Some(Reply::Calls(text, calls)) => Ok(Completion {
                message: Message::assistant_with_calls(text, calls),
                usage: None,
            }),
            Some(Reply::Transient) => Err(ProviderError::transient("rate limited")),
            Some(Reply::Fatal) => Err(ProviderError::fatal("bad request")),
            None => Err(ProviderError::fatal("script exhausted")),
        }
    }
}

/// Routes scripted replies by the first user message of the request, so a
/// parent and a concurrently running child cannot pop each other's replies.
struct RoutedProvider {
    routes: Mutex<std::collections::HashMap<String, VecDeque<Reply>>>,
}

impl RoutedProvider {
    fn new(routes: Vec<(&str, Vec<Reply>)>) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(
                routes
                    .into_iter()
                    .map(|(key, replies)| (key.to_owned(), replies.into()))
                    .collect(),
            ),
        })
    }
}

#[async_trait::async_trait]
impl Provider for RoutedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        _stream: Option<TextDeltaSink>,
    ) -> std::result::Result<Completion, ProviderError> {
        let key = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let reply = self
            .routes
            .lock()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(Reply::Text(text)) => Ok(Completion {
                message: Message::assistant(text),
                usage: None,
            }),
            Some(Reply::Calls(text, calls)) => Ok(Completion {
                message: Message::assistant_with_calls(text, calls),
                usage: None,
            }),
            Some(Reply::Transient) => Err(ProviderError::transient("rate limited")),
            Some(Reply::Fatal) | None => Err(ProviderError::fatal("no scripted reply")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct EchoTool;

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let x = arguments.get("x").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolOutput::text(x))
    }
}

/// Signals when it starts, then blocks until released or cancelled.
struct GateTool {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ToolHandler for GateTool {
    async fn execute(&self, _arguments: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let _ = self.started.send(());
        tokio::select! {
            _ = self.release.notified() => Ok(ToolOutput::text("gate opened")),
            _ = ctx.cancel.cancelled() => Ok(ToolOutput::text("gate cancelled")),
        }
    }
}

fn tool_def(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: format!("test tool {name}"),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "string" } }
        }),
    }
}

fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event recording
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Value>>>);

impl EventSink for Recorder {
    fn on_event(&self, event: &AgentEvent) {
        self.0
            .lock()
            .push(serde_json::to_value(event).expect("event serializes"));
    }
}

impl Recorder {
    fn events(&self) -> Vec<Value> {
        self.0.lock().clone()
    }

    fn kinds(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e["type"].as_str().unwrap_or("?").to_owned())
            .collect()
    }
}

/// Property 4: every `*_start` pairs with one `*_end`, and tool execution
/// events appear only inside an open turn.
fn assert_event_pairing(events: &[Value]) {
    let mut open_turns = 0i32;
    let mut open_messages = 0i32;
    let mut open_tools = 0i32;
    for event in events {
        match event["type"].as_str().unwrap() {
            "turn_start" => open_turns += 1,
            "turn_end" => {
                open_turns -= 1;
                assert!(open_turns >= 0, "turn_end without turn_start");
            }
            "message_start" => open_messages += 1,
            "message_end" => {
                open_messages -= 1;
                assert!(open_messages >= 0, "message_end without message_start");
            }
            "tool_execution_start" => {
                assert!(open_turns > 0, "tool event outside a turn");
                open_tools += 1;
            }
            "tool_execution_end" => {
                assert!(open_turns > 0, "tool event outside a turn");
                open_tools -= 1;
                assert!(open_tools >= 0, "tool_execution_end without start");
            }
            _ => {}
        }
    }
    assert_eq!(open_turns, 0, "unmatched turn_start");
    assert_eq!(open_messages, 0, "unmatched message_start");
    assert_eq!(open_tools, 0, "unmatched tool_execution_start");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.provider = "fake".into();
    config.model = "fake-1".into();
    config.sessions_dir = dir.join("sessions");
    config.retry_base_seconds = 0.01;
    config.lane_warn_wait_ms = 50;
    config
}

fn build_agent(config: Config, provider: Arc<FakeProvider>, recorder: &Recorder) -> Agent {
    Agent::builder(config)
        .provider(provider)
        .on_event(recorder.clone())
        .extra_tool(tool_def("echo"), Arc::new(EchoTool))
        .build()
        .expect("agent builds")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s1_pure_text() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("hi")]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    let outcome = agent.chat("s1", "hello").await.unwrap();
    assert_eq!(outcome.status, RunEndStatus::Completed);
    assert_eq!(outcome.final_text.as_deref(), Some("hi"));

    assert_eq!(
        recorder.kinds(),
        vec![
            "agent_start",
            "turn_start",
            "message_start",
            "message_end",
            "message_start",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );
    let events = recorder.events();
    assert_eq!(events[1]["round"], 1);
    assert_eq!(events[2]["role"], "user");
    assert_eq!(events[5]["role"], "assistant");
    assert_eq!(events[5]["text_preview"], "hi");
    assert_eq!(events[6]["status"], "completed");
    assert_eq!(events[7]["final_text"], "hi");

    // Journal: user + assistant (the header is not a message).
    let journal = agent.sessions().snapshot("s1").unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].role, Role::User);
    assert_eq!(journal[1].role, Role::Assistant);

    // Usage deltas landed on the header.
    assert_eq!(agent.sessions().open("s1").unwrap().usage.total_tokens, 10);
}

#[tokio::test]
async fn s2_one_tool_then_text() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Calls("", vec![call("tc_1", "echo", serde_json::json!({"x": "A"}))]),
        Reply::Text("done"),
    ]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    let outcome = agent.chat("s2", "run the tool").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("done"));

    let events = recorder.events();
    assert_event_pairing(&events);

    let turn_ends: Vec<&Value> = events.iter().filter(|e| e["type"] == "turn_end").collect();
    assert_eq!(turn_ends.len(), 2);
    assert_eq!(turn_ends[0]["status"], "tool_calls_processed");
    assert_eq!(turn_ends[0]["tool_calls_count"], 1);
    assert_eq!(turn_ends[1]["status"], "completed");
    assert_eq!(events.last().unwrap()["final_text"], "done");

    // Property 1: the tool call is answered in order, before the next
    // assistant message.
    let journal = agent.sessions().snapshot("s2").unwrap();
    assert_eq!(journal.len(), 4);
    assert!(journal[1].has_tool_calls());
    assert_eq!(journal[2].role, Role::Tool);
    assert_eq!(journal[2].tool_call_id.as_deref(), Some("tc_1"));
    assert_eq!(journal[2].content, "A");
    assert_eq!(journal[3].content, "done");
}

#[tokio::test]
async fn s3_steer_mid_batch() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Calls(
            "working",
            vec![
                call("t1", "gate", serde_json::json!({})),
                call("t2", "echo", serde_json::json!({"x": "B"})),
            ],
        ),
        Reply::Text("adjusted"),
    ]);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let agent = Agent::builder(test_config(dir.path()))
        .provider(provider)
        .on_event(recorder.clone())
        .extra_tool(tool_def("echo"), Arc::new(EchoTool))
        .extra_tool(
            tool_def("gate"),
            Arc::new(GateTool {
                started: started_tx,
                release: release.clone(),
            }),
        )
        .build()
        .unwrap();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("s3", "go").await })
    };

    // Steer while t1 is executing, then let it finish.
    started_rx.recv().await.unwrap();
    agent.steer("s3", "stop");
    release.notify_one();

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("adjusted"));

    let events = recorder.events();
    assert_event_pairing(&events);

    // t1 completed normally; t2 was skipped with paired events.
    let t1_end = events
        .iter()
        .find(|e| e["type"] == "tool_execution_end" && e["call_id"] == "t1")
        .unwrap();
    assert!(t1_end.get("skipped").is_none());
    let t2_start = events
        .iter()
        .find(|e| e["type"] == "tool_execution_start" && e["call_id"] == "t2")
        .unwrap();
    assert_eq!(t2_start["skipped"], true);
    let t2_end = events
        .iter()
        .find(|e| e["type"] == "tool_execution_end" && e["call_id"] == "t2")
        .unwrap();
    assert_eq!(t2_end["skipped"], true);

    let turn_ends: Vec<&Value> = events.iter().filter(|e| e["type"] == "turn_end").collect();
    assert_eq!(turn_ends[0]["status"], "steered");
    assert_eq!(turn_ends[1]["status"], "completed");

    // Journal: t1 result, t2 skipped marker, then exactly one steer message.
    let journal = agent.sessions().snapshot("s3").unwrap();
    let t1_msg = journal.iter().find(|m| m.tool_call_id.as_deref() == Some("t1")).unwrap();
    assert_eq!(t1_msg.content, "gate opened");
    let t2_msg = journal.iter().find(|m| m.tool_call_id.as_deref() == Some("t2")).unwrap();
    assert_eq!(t2_msg.content, SKIPPED_TOOL_RESULT);
    assert_eq!(t2_msg.source, Some(Source::Skipped));
    let steers: Vec<&Message> = journal
        .iter()
        .filter(|m| m.source == Some(Source::Steer))
        .collect();
    assert_eq!(steers.len(), 1);
    assert_eq!(steers[0].content, "stop");
    assert_eq!(steers[0].role, Role::User);
}

#[tokio::test]
async fn s4_follow_up_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("hi"), Reply::Text("fine, thanks")]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    agent.follow_up("s4", "and you?");
    let outcome = agent.chat("s4", "hello").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("fine, thanks"));

    let events = recorder.events();
    assert_event_pairing(&events);
    // One run: a single agent_start/agent_end pair around two rounds.
    assert_eq!(events.iter().filter(|e| e["type"] == "agent_start").count(), 1);
    assert_eq!(events.iter().filter(|e| e["type"] == "agent_end").count(), 1);
    let turn_ends: Vec<&Value> = events.iter().filter(|e| e["type"] == "turn_end").collect();
    assert_eq!(turn_ends[0]["status"], "follow_up_injected");
    assert_eq!(turn_ends[1]["status"], "completed");

    let journal = agent.sessions().snapshot("s4").unwrap();
    let injected = journal.iter().find(|m| m.source == Some(Source::FollowUp)).unwrap();
    assert_eq!(injected.content, "and you?");
    assert_eq!(injected.role, Role::User);
}

#[tokio::test]
async fn s5_compaction_under_budget() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("ok")]);

    let mut config = test_config(dir.path());
    config.context.max_chars = 200;
    config.context.compact_trigger_chars = 300;
    config.context.keep_last_messages = 2;
    config.context.compact_keep_tail = 2;
    let agent = build_agent(config, provider.clone(), &recorder);

    // 20 synthetic turns summing to 1000 chars.
    for i in 0..20 {
        let body = format!("{i:03} {}", "x".repeat(46));
        let msg = if i % 2 == 0 {
            Message::user(body)
        } else {
            Message::assistant(body)
        };
        agent.sessions().append("s5", msg).unwrap();
    }

    agent.chat("s5", "next").await.unwrap();

    // The journal's old prefix became exactly one compaction summary.
    let journal = agent.sessions().snapshot("s5").unwrap();
    let summaries: Vec<&Message> = journal
        .iter()
        .filter(|m| m.source == Some(Source::Compaction))
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(journal[0].source, Some(Source::Compaction));
    assert_eq!(journal[0].role, Role::System);
    // Summary + 2 kept tail messages (the injected user message is part of
    // the tail) + the assistant reply.
    assert_eq!(journal.len(), 4);
    assert_eq!(journal[2].content, "next");

    // The history handed to the provider fit the budget (the leading
    // system prompt is not part of the session history).
    let history = provider.last_history.lock().clone();
    assert_eq!(history[0].role, Role::System);
    let total: usize = history[1..].iter().map(|m| m.size_bytes()).sum();
    assert!(total <= 200, "provider saw {total} chars of history");
}

#[tokio::test]
async fn s6_same_session_serializes() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::with_delay(
        vec![Reply::Text("one"), Reply::Text("two")],
        Duration::from_millis(30),
    );
    let agent = build_agent(test_config(dir.path()), provider.clone(), &recorder);

    let a = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("s6", "first").await })
    };
    let b = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("s6", "second").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Property 2: never two provider calls in flight for one session.
    assert_eq!(provider.peak_in_flight.load(Ordering::SeqCst), 1);

    // The second run's agent_start comes after the first run's agent_end.
    let kinds = recorder.kinds();
    let first_end = kinds.iter().position(|k| k == "agent_end").unwrap();
    let second_start = kinds.iter().rposition(|k| k == "agent_start").unwrap();
    assert!(second_start > first_end);
}

#[tokio::test]
async fn s6_distinct_sessions_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::with_delay(
        vec![Reply::Text("one"), Reply::Text("two")],
        Duration::from_millis(50),
    );
    let mut config = test_config(dir.path());
    config.max_concurrent = 2;
    let agent = build_agent(config, provider.clone(), &recorder);

    let a = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("left", "first").await })
    };
    let b = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("right", "second").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(provider.peak_in_flight.load(Ordering::SeqCst), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop guard, retry, cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn loop_guard_trips_after_three_identical_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let same = || {
        Reply::Calls(
            "thinking",
            vec![call("tc", "echo", serde_json::json!({"x": "same"}))],
        )
    };
    let provider = FakeProvider::new((0..10).map(|_| same()).collect());
    let agent = build_agent(test_config(dir.path()), provider.clone(), &recorder);

    let outcome = agent.chat("loop", "go").await.unwrap();
    assert_eq!(outcome.status, RunEndStatus::LoopDetected);
    assert_eq!(outcome.final_text.as_deref(), Some("thinking"));

    // Property 7: exactly three provider calls, then no more.
    assert_eq!(provider.calls(), 3);

    let events = recorder.events();
    assert_event_pairing(&events);
    let last_turn_end = events.iter().rfind(|e| e["type"] == "turn_end").unwrap();
    assert_eq!(last_turn_end["status"], "loop_detected");

    // The third round dispatched nothing: two tool batches ran.
    let dispatched = events
        .iter()
        .filter(|e| e["type"] == "tool_execution_start")
        .count();
    assert_eq!(dispatched, 2);
}

#[tokio::test]
async fn transient_provider_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Transient,
        Reply::Transient,
        Reply::Text("recovered"),
    ]);
    let agent = build_agent(test_config(dir.path()), provider.clone(), &recorder);

    let outcome = agent.chat("retry", "go").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("recovered"));
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn fatal_provider_error_fails_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Fatal]);
    let agent = build_agent(test_config(dir.path()), provider.clone(), &recorder);

    let result = agent.chat("fatal", "go").await;
    assert!(result.is_err());
    assert_eq!(provider.calls(), 1);

    // The event stream still closed with matching end events.
    let kinds = recorder.kinds();
    let events = recorder.events();
    assert_event_pairing(&events);
    let turn_end = events.iter().find(|e| e["type"] == "turn_end").unwrap();
    assert_eq!(turn_end["status"], "failed");
    assert_eq!(kinds.last().map(String::as_str), Some("agent_end"));
}

#[tokio::test]
async fn retry_exhaustion_fails_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Transient,
        Reply::Transient,
        Reply::Transient,
        Reply::Transient,
    ]);
    let mut config = test_config(dir.path());
    config.max_retries = 2;
    let agent = build_agent(config, provider.clone(), &recorder);

    let result = agent.chat("exhausted", "go").await;
    assert!(result.is_err());
    // 1 initial attempt + 2 retries.
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn cancel_mid_batch_skips_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Calls(
        "",
        vec![
            call("t1", "gate", serde_json::json!({})),
            call("t2", "echo", serde_json::json!({"x": "never"})),
        ],
    )]);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let agent = Agent::builder(test_config(dir.path()))
        .provider(provider.clone())
        .on_event(recorder.clone())
        .extra_tool(tool_def("echo"), Arc::new(EchoTool))
        .extra_tool(
            tool_def("gate"),
            Arc::new(GateTool {
                started: started_tx,
                release: release.clone(),
            }),
        )
        .build()
        .unwrap();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("cancel", "go").await })
    };

    started_rx.recv().await.unwrap();
    agent.cancel("cancel");

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunEndStatus::Cancelled);
    // Only the first provider call happened.
    assert_eq!(provider.calls(), 1);

    let events = recorder.events();
    assert_event_pairing(&events);
    let turn_end = events.iter().rfind(|e| e["type"] == "turn_end").unwrap();
    assert_eq!(turn_end["status"], "cancelled");

    // The gate observed the cancel; t2 got a skipped result, so every call
    // id in the journal is answered.
    let journal = agent.sessions().snapshot("cancel").unwrap();
    let t1_msg = journal.iter().find(|m| m.tool_call_id.as_deref() == Some("t1")).unwrap();
    assert_eq!(t1_msg.content, "gate cancelled");
    let t2_msg = journal.iter().find(|m| m.tool_call_id.as_deref() == Some("t2")).unwrap();
    assert_eq!(t2_msg.source, Some(Source::Skipped));
}

#[tokio::test]
async fn cancel_interrupts_an_in_flight_provider_call() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    // A reply that would take far longer than the test allows: only an
    // interrupted call lets the run finish in time.
    let provider = FakeProvider::with_delay(
        vec![Reply::Text("never delivered")],
        Duration::from_secs(30),
    );
    let agent = build_agent(test_config(dir.path()), provider.clone(), &recorder);

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("inflight", "go").await })
    };

    // Let the run enter the provider call, then cancel while it sleeps.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.in_flight.load(Ordering::SeqCst), 1);
    agent.cancel("inflight");

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancel did not interrupt the provider call")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, RunEndStatus::Cancelled);
    assert_eq!(provider.calls(), 1);

    let events = recorder.events();
    assert_event_pairing(&events);
    let turn_end = events.iter().rfind(|e| e["type"] == "turn_end").unwrap();
    assert_eq!(turn_end["status"], "cancelled");
    assert_eq!(
        recorder.kinds().last().map(String::as_str),
        Some("agent_end")
    );

    // Nothing from the aborted call reached the journal.
    let journal = agent.sessions().snapshot("inflight").unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].role, Role::User);
}

#[tokio::test]
async fn terminal_steer_starts_a_new_round() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("first"), Reply::Text("after steer")]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    agent.steer("ts", "change direction");
    let outcome = agent.chat("ts", "go").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("after steer"));

    let events = recorder.events();
    let turn_ends: Vec<&Value> = events.iter().filter(|e| e["type"] == "turn_end").collect();
    assert_eq!(turn_ends[0]["status"], "steered");
    assert_eq!(turn_ends[1]["status"], "completed");
}

#[tokio::test]
async fn streaming_emits_message_updates() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("streamed words here")]);
    let deltas: Arc<Mutex<String>> = Arc::default();
    let deltas2 = deltas.clone();

    let mut config = test_config(dir.path());
    config.stream = true;
    let agent = Agent::builder(config)
        .provider(provider)
        .on_event(recorder.clone())
        .on_text_delta(move |d| deltas2.lock().push_str(d))
        .build()
        .unwrap();

    agent.chat("stream", "go").await.unwrap();

    let updates: Vec<String> = recorder
        .events()
        .iter()
        .filter(|e| e["type"] == "message_update")
        .map(|e| e["delta"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(updates.join(""), "streamed words here");
    assert_eq!(deltas.lock().as_str(), "streamed words here");
}

#[tokio::test]
async fn non_streaming_runs_emit_no_updates() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("quiet")]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    agent.chat("quiet", "go").await.unwrap();
    // Invariant (c): no message_update events when streaming is disabled.
    assert!(!recorder.kinds().iter().any(|k| k == "message_update"));
}

#[tokio::test]
async fn continue_run_restarts_round_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![Reply::Text("first"), Reply::Text("resumed")]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    agent.chat("cr", "hello").await.unwrap();
    // Terminal assistant message: continue_run is invalid here.
    assert!(agent.continue_run("cr").await.is_err());

    agent
        .sessions()
        .append("cr", Message::user("pending question"))
        .unwrap();
    let outcome = agent.continue_run("cr").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("resumed"));

    // Each run numbers its rounds from 1.
    let rounds: Vec<i64> = recorder
        .events()
        .iter()
        .filter(|e| e["type"] == "turn_start")
        .map(|e| e["round"].as_i64().unwrap())
        .collect();
    assert_eq!(rounds, vec![1, 1]);
}

#[tokio::test]
async fn unknown_tool_becomes_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Calls("", vec![call("tc", "no_such_tool", serde_json::json!({}))]),
        Reply::Text("recovered"),
    ]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    let outcome = agent.chat("unknown", "go").await.unwrap();
    // Tool failure is recovered locally; the loop continued.
    assert_eq!(outcome.final_text.as_deref(), Some("recovered"));

    let journal = agent.sessions().snapshot("unknown").unwrap();
    let tool_msg = journal.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.starts_with(TOOL_ERROR_PREFIX));

    let end = recorder
        .events()
        .iter()
        .find(|e| e["type"] == "tool_execution_end")
        .cloned()
        .unwrap();
    assert_eq!(end["is_error"], true);
    assert_eq!(end["details"]["kind"], "error");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn subagent_spawn_wait_returns_final_text() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Calls(
            "delegating",
            vec![call(
                "tc_spawn",
                "sessions_spawn",
                serde_json::json!({"task": "investigate", "wait": true}),
            )],
        ),
        Reply::Text("child says hi"),
        Reply::Text("parent done"),
    ]);
    let agent = build_agent(test_config(dir.path()), provider, &recorder);

    let outcome = agent.chat("parent", "delegate this").await.unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("parent done"));

    // The run record reached completed with the child's answer.
    let runs = agent.subagents().list(None);
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.depth, 1);
    assert_eq!(run.parent_session_id, "parent");
    assert_eq!(run.final_text.as_deref(), Some("child says hi"));

    // The tool result carried the child's final text back to the parent.
    let journal = agent.sessions().snapshot("parent").unwrap();
    let tool_msg = journal
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("tc_spawn"))
        .unwrap();
    assert_eq!(tool_msg.content, "child says hi");

    // Child session header points back at the parent.
    let child_header = agent.sessions().open(&run.session_id).unwrap();
    assert_eq!(child_header.parent_session_id.as_deref(), Some("parent"));

    // Announce: a system note about the completed run.
    assert!(journal
        .iter()
        .any(|m| m.role == Role::System && m.content.contains("completed")));

    // The child's buffered event tail is available.
    let tail = agent.subagents().events_tail(&run.run_id).unwrap();
    assert!(!tail.is_empty());
    assert!(matches!(tail[0], AgentEvent::AgentStart { .. }));
    assert!(matches!(tail.last().unwrap(), AgentEvent::AgentEnd { .. }));
}

#[tokio::test]
async fn subagent_depth_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        Reply::Calls(
            "",
            vec![call(
                "tc_spawn",
                "sessions_spawn",
                serde_json::json!({"task": "too deep"}),
            )],
        ),
        Reply::Text("gave up"),
    ]);
    let mut config = test_config(dir.path());
    config.subagents.max_depth = 0;
    let agent = build_agent(config, provider, &recorder);

    agent.chat("root", "spawn").await.unwrap();

    let journal = agent.sessions().snapshot("root").unwrap();
    let tool_msg = journal.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.starts_with(TOOL_ERROR_PREFIX));
    assert!(tool_msg.content.contains("depth"));
    assert!(agent.subagents().list(None).is_empty());
}

#[tokio::test]
async fn subagent_kill_is_idempotent_and_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = RoutedProvider::new(vec![
        (
            "spawn a child",
            vec![
                Reply::Calls(
                    "",
                    vec![call(
                        "tc_spawn",
                        "sessions_spawn",
                        serde_json::json!({"task": "hang"}),
                    )],
                ),
                Reply::Text("spawned"),
            ],
        ),
        // Child: hangs on the gate tool until cancelled.
        (
            "hang",
            vec![Reply::Calls(
                "",
                vec![call("tc_gate", "gate", serde_json::json!({}))],
            )],
        ),
    ]);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let agent = Agent::builder(test_config(dir.path()))
        .provider(provider)
        .on_event(recorder.clone())
        .extra_tool(
            tool_def("gate"),
            Arc::new(GateTool {
                started: started_tx,
                release,
            }),
        )
        .build()
        .unwrap();

    agent.chat("killer", "spawn a child").await.unwrap();

    // Wait until the child is actually inside its tool call.
    started_rx.recv().await.unwrap();
    let run_id = agent.subagents().list(None)[0].run_id;

    assert_eq!(agent.subagents().kill(&run_id), Some(RunState::Cancelled));
    // Idempotent: the second kill reports the same state.
    assert_eq!(agent.subagents().kill(&run_id), Some(RunState::Cancelled));

    // The child loop unwinds to a terminal record.
    for _ in 0..100 {
        if agent
            .subagents()
            .get(&run_id)
            .is_some_and(|r| r.state.is_terminal())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.subagents().get(&run_id).unwrap().state, RunState::Cancelled);
}

#[tokio::test]
async fn subagent_timeout_cancels_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = RoutedProvider::new(vec![
        (
            "spawn",
            vec![
                Reply::Calls(
                    "",
                    vec![call(
                        "tc_spawn",
                        "sessions_spawn",
                        serde_json::json!({"task": "hang"}),
                    )],
                ),
                Reply::Text("spawned"),
            ],
        ),
        (
            "hang",
            vec![Reply::Calls(
                "",
                vec![call("tc_gate", "gate", serde_json::json!({}))],
            )],
        ),
    ]);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let mut config = test_config(dir.path());
    config.subagents.run_timeout_seconds = 1;
    let agent = Agent::builder(config)
        .provider(provider)
        .on_event(recorder.clone())
        .extra_tool(
            tool_def("gate"),
            Arc::new(GateTool {
                started: started_tx,
                release,
            }),
        )
        .build()
        .unwrap();

    agent.chat("slowpoke", "spawn").await.unwrap();
    started_rx.recv().await.unwrap();
    let run_id = agent.subagents().list(None)[0].run_id;

    // Worst case: 1s timeout plus loop teardown.
    for _ in 0..300 {
        if agent
            .subagents()
            .get(&run_id)
            .is_some_and(|r| r.state.is_terminal())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.subagents().get(&run_id).unwrap().state, RunState::TimedOut);
}

#[tokio::test]
async fn subagent_steer_reaches_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let provider = FakeProvider::new(vec![
        // Parent: spawn, then finish.
        Reply::Calls(
            "",
            vec![call(
                "tc_spawn",
                "sessions_spawn",
                serde_json::json!({"task": "work", "wait": true}),
            )],
        ),
        // Child round 1: tool batch interrupted by the steer below.
        Reply::Calls(
            "",
            vec![
                call("c1", "gate", serde_json::json!({})),
                call("c2", "gate", serde_json::json!({})),
            ],
        ),
        // Child round 2: answers the steer.
        Reply::Text("redirected"),
        Reply::Text("parent done"),
    ]);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let agent = Agent::builder(test_config(dir.path()))
        .provider(provider)
        .on_event(recorder.clone())
        .extra_tool(
            tool_def("gate"),
            Arc::new(GateTool {
                started: started_tx,
                release: release.clone(),
            }),
        )
        .build()
        .unwrap();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.chat("steerer", "go").await })
    };

    // The child is inside c1; steer it, then open the gate.
    started_rx.recv().await.unwrap();
    let run_id = agent.subagents().list(None)[0].run_id;
    assert!(agent.subagents().steer(&run_id, "do it differently"));
    release.notify_one();

    runner.await.unwrap().unwrap();

    let run = agent.subagents().get(&run_id).unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.final_text.as_deref(), Some("redirected"));

    // Child journal: c2 skipped, steer message injected.
    let child = agent.sessions().snapshot(&run.session_id).unwrap();
    let skipped = child.iter().find(|m| m.source == Some(Source::Skipped)).unwrap();
    assert_eq!(skipped.tool_call_id.as_deref(), Some("c2"));
    assert!(child
        .iter()
        .any(|m| m.source == Some(Source::Steer) && m.content == "do it differently"));
}
