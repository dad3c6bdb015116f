//! Subagent runs: spawn, track, steer, kill, and optionally join child
//! sessions.
//!
//! Every spawn creates a child session (with `parent_session_id` in its
//! header) and a [`SubagentRun`] record. Child loops execute through the
//! shared lane queue but draw workers from their own pool. Each run keeps a
//! bounded ring of its lifecycle events; the parent inspects them through
//! the `subagents` tool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use spindle_domain::{AgentEvent, Error, Message, Result, SubagentConfig, ToolOutput};

use crate::agent::RuntimeState;
use crate::events::{EventBus, EventSink};
use crate::lanes::BoxedWork;
use crate::steering::SteeringController;
use crate::tools::ToolContext;
use crate::turn::{self, RunEndStatus, RunOutcome, RunParams};
use crate::truncate_str;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubagentRun {
    pub run_id: Uuid,
    pub session_id: String,
    pub parent_session_id: String,
    pub depth: u32,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubagentRun {
    fn new(session_id: String, parent_session_id: String, depth: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_id,
            parent_session_id,
            depth,
            state: RunState::Queued,
            started_at: Utc::now(),
            finished_at: None,
            final_text: None,
            error: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type EventRing = Arc<Mutex<VecDeque<AgentEvent>>>;

/// Global mapping of subagent runs, their steering controllers, and their
/// buffered event tails.
pub struct SubagentRegistry {
    runs: RwLock<HashMap<Uuid, SubagentRun>>,
    steering: RwLock<HashMap<Uuid, Arc<SteeringController>>>,
    events: RwLock<HashMap<Uuid, EventRing>>,
    workers: Arc<Semaphore>,
    event_buffer: usize,
}

impl SubagentRegistry {
    pub(crate) fn new(cfg: &SubagentConfig) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            steering: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(cfg.max_workers.max(1))),
            event_buffer: cfg.event_buffer.max(1),
        }
    }

    pub fn get(&self, run_id: &Uuid) -> Option<SubagentRun> {
        self.runs.read().get(run_id).cloned()
    }

    /// Runs ordered oldest-first, optionally filtered by state.
    pub fn list(&self, state: Option<RunState>) -> Vec<SubagentRun> {
        let mut runs: Vec<SubagentRun> = self
            .runs
            .read()
            .values()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Enqueue a steering message for a run. False when the run is unknown.
    pub fn steer(&self, run_id: &Uuid, text: impl Into<String>) -> bool {
        match self.steering.read().get(run_id) {
            Some(ctl) => {
                ctl.steer(text);
                true
            }
            None => false,
        }
    }

    /// Kill a run. Idempotent: a terminal run keeps its state, which is
    /// reported back either way.
    pub fn kill(&self, run_id: &Uuid) -> Option<RunState> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(run_id)?;
        if run.state.is_terminal() {
            return Some(run.state);
        }
        if let Some(ctl) = self.steering.read().get(run_id) {
            ctl.cancel();
        }
        run.state = RunState::Cancelled;
        run.finished_at = Some(Utc::now());
        Some(RunState::Cancelled)
    }

    /// The buffered event tail for a run, oldest first.
    pub fn events_tail(&self, run_id: &Uuid) -> Option<Vec<AgentEvent>> {
        self.events
            .read()
            .get(run_id)
            .map(|ring| ring.lock().iter().cloned().collect())
    }

    fn update<F>(&self, run_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut SubagentRun),
    {
        let mut runs = self.runs.write();
        match runs.get_mut(run_id) {
            Some(run) => {
                f(run);
                true
            }
            None => false,
        }
    }

    /// Transition to a terminal state unless one was already set (a kill
    /// must not be overwritten by the loop winding down afterwards).
    fn finalize(
        &self,
        run_id: &Uuid,
        state: RunState,
        final_text: Option<String>,
        error: Option<String>,
    ) -> Option<RunState> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(run_id)?;
        if run.state.is_terminal() {
            if run.final_text.is_none() {
                run.final_text = final_text;
            }
            return Some(run.state);
        }
        run.state = state;
        run.finished_at = Some(Utc::now());
        run.final_text = final_text;
        run.error = error;
        Some(state)
    }
}

/// Sink that feeds a run's bounded event ring.
struct RingSink {
    ring: EventRing,
    cap: usize,
}

impl EventSink for RingSink {
    fn on_event(&self, event: &AgentEvent) {
        let mut ring = self.ring.lock();
        if ring.len() == self.cap {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn a child run for `task`. Validates the depth budget, creates the
/// child session, registers the run as queued, and hands the rest to a
/// supervisor task.
pub(crate) fn spawn(
    state: &Arc<RuntimeState>,
    parent_session_id: &str,
    parent_depth: u32,
    task: String,
) -> Result<Uuid> {
    let cfg = &state.config.subagents;
    let depth = parent_depth + 1;
    if depth > cfg.max_depth {
        return Err(Error::DepthExceeded {
            depth,
            max: cfg.max_depth,
        });
    }

    let session_id = Uuid::new_v4().to_string();
    state.store.open_child(&session_id, parent_session_id)?;

    let run = SubagentRun::new(session_id.clone(), parent_session_id.to_owned(), depth);
    let run_id = run.run_id;

    let registry = &state.subagents;
    let controller = Arc::new(SteeringController::new());
    let ring: EventRing = Arc::new(Mutex::new(VecDeque::new()));
    registry.runs.write().insert(run_id, run);
    registry.steering.write().insert(run_id, controller.clone());
    registry.events.write().insert(run_id, ring.clone());

    tracing::info!(%run_id, session_id = %session_id, depth, "subagent spawned");
    tokio::spawn(supervise(
        state.clone(),
        run_id,
        session_id,
        depth,
        task,
        controller,
        ring,
    ));
    Ok(run_id)
}

async fn supervise(
    state: Arc<RuntimeState>,
    run_id: Uuid,
    session_id: String,
    depth: u32,
    task: String,
    controller: Arc<SteeringController>,
    ring: EventRing,
) {
    let registry = &state.subagents;

    let permit = match registry.workers.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            registry.finalize(
                &run_id,
                RunState::Failed,
                None,
                Some("worker pool closed".into()),
            );
            return;
        }
    };

    // Killed while still queued: nothing to do.
    if registry.get(&run_id).is_none_or(|r| r.state.is_terminal()) {
        return;
    }
    registry.update(&run_id, |r| r.state = RunState::Running);

    let cancel = controller.register_token();
    let bus = Arc::new(EventBus::new(vec![Arc::new(RingSink {
        ring,
        cap: registry.event_buffer,
    })]));
    let params = RunParams {
        session_id: session_id.clone(),
        depth,
        initial_message: Some(Message::user(task)),
    };
    let work: BoxedWork<Result<RunOutcome>> = Box::pin(turn::run_loop(
        state.clone(),
        params,
        controller.clone(),
        cancel.clone(),
        bus,
    ));
    let mut handle = state
        .lanes
        .submit_unmetered(&session_id, cancel.clone(), work);

    let timeout_secs = state.config.subagents.run_timeout_seconds;
    let (joined, timed_out) = if timeout_secs > 0 {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut handle).await {
            Ok(joined) => (joined, false),
            Err(_) => {
                tracing::warn!(%run_id, timeout_secs, "subagent run timed out");
                cancel.cancel();
                ((&mut handle).await, true)
            }
        }
    } else {
        ((&mut handle).await, false)
    };
    controller.release_token(&cancel);
    drop(permit);

    let (end_state, final_text, error) = match joined {
        // The lane dropped the work before it started.
        Err(_) => (RunState::Cancelled, None, None),
        Ok(Err(e)) => (RunState::Failed, None, Some(e.to_string())),
        Ok(Ok(outcome)) => match outcome.status {
            RunEndStatus::Completed | RunEndStatus::LoopDetected => {
                (RunState::Completed, outcome.final_text, None)
            }
            RunEndStatus::Cancelled => {
                let state = if timed_out {
                    RunState::TimedOut
                } else {
                    RunState::Cancelled
                };
                (state, outcome.final_text, None)
            }
        },
    };
    let resulting = registry.finalize(&run_id, end_state, final_text, error);

    if state.config.subagents.announce_completion {
        announce(&state, &run_id, resulting.unwrap_or(end_state));
    }
}

/// Append a system-authored completion summary to the parent session.
fn announce(state: &Arc<RuntimeState>, run_id: &Uuid, end_state: RunState) {
    let Some(run) = state.subagents.get(run_id) else {
        return;
    };
    let preview = run
        .final_text
        .as_deref()
        .or(run.error.as_deref())
        .map(|t| truncate_str(t, 200))
        .unwrap_or_default();
    let note = if preview.is_empty() {
        format!("[subagent {run_id} {}]", end_state.as_str())
    } else {
        format!("[subagent {run_id} {}] {preview}", end_state.as_str())
    };
    if let Err(e) = state
        .store
        .append(&run.parent_session_id, Message::system(note))
    {
        tracing::warn!(%run_id, error = %e, "failed to announce subagent completion");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool_err(message: impl Into<String>) -> Error {
    Error::Tool {
        name: "subagents".into(),
        message: message.into(),
    }
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| tool_err(format!("missing required argument: {key}")))
}

fn parse_run_id(arguments: &Value) -> Result<Uuid> {
    Uuid::parse_str(required_str(arguments, "run_id")?)
        .map_err(|e| tool_err(format!("invalid run_id: {e}")))
}

/// `sessions_spawn {task, wait?, timeout_seconds?}`
pub(crate) async fn tool_spawn(
    state: &Arc<RuntimeState>,
    arguments: &Value,
    ctx: &ToolContext,
) -> Result<ToolOutput> {
    let task = arguments
        .get("task")
        .and_then(Value::as_str)
        .ok_or_else(|| tool_err("missing required argument: task"))?;
    let wait = arguments
        .get("wait")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let run_id = spawn(state, &ctx.session_id, ctx.depth, task.to_owned())?;

    if !wait {
        return Ok(ToolOutput::with_details(
            serde_json::json!({ "run_id": run_id, "state": "queued" }).to_string(),
            serde_json::json!({ "run_id": run_id }),
        ));
    }

    let timeout = arguments.get("timeout_seconds").and_then(Value::as_u64);
    let run = join_run(state, &run_id, timeout, ctx).await?;
    Ok(ToolOutput::with_details(
        run.final_text.clone().unwrap_or_default(),
        serde_json::json!({ "run_id": run_id, "state": run.state }),
    ))
}

/// `subagents {action, run_id?, text?, wait?}`
pub(crate) async fn tool_manage(
    state: &Arc<RuntimeState>,
    arguments: &Value,
    ctx: &ToolContext,
) -> Result<ToolOutput> {
    let registry = &state.subagents;
    match required_str(arguments, "action")? {
        "list" => {
            let runs = registry.list(None);
            Ok(ToolOutput::text(serde_json::to_string(&runs)?))
        }
        "get_result" => {
            let run_id = parse_run_id(arguments)?;
            let run = if arguments.get("wait").and_then(Value::as_bool).unwrap_or(false) {
                join_run(state, &run_id, None, ctx).await?
            } else {
                registry
                    .get(&run_id)
                    .ok_or_else(|| tool_err(format!("unknown run: {run_id}")))?
            };
            Ok(ToolOutput::text(serde_json::to_string(&run)?))
        }
        "events" => {
            let run_id = parse_run_id(arguments)?;
            let tail = registry
                .events_tail(&run_id)
                .ok_or_else(|| tool_err(format!("unknown run: {run_id}")))?;
            Ok(ToolOutput::text(serde_json::to_string(&tail)?))
        }
        "steer" => {
            let run_id = parse_run_id(arguments)?;
            let text = required_str(arguments, "text")?;
            if !registry.steer(&run_id, text) {
                return Err(tool_err(format!("unknown run: {run_id}")));
            }
            Ok(ToolOutput::text(
                serde_json::json!({ "run_id": run_id, "steered": true }).to_string(),
            ))
        }
        "kill" => {
            let run_id = parse_run_id(arguments)?;
            let state = registry
                .kill(&run_id)
                .ok_or_else(|| tool_err(format!("unknown run: {run_id}")))?;
            Ok(ToolOutput::text(
                serde_json::json!({ "run_id": run_id, "state": state }).to_string(),
            ))
        }
        other => Err(tool_err(format!("unknown action: {other}"))),
    }
}

/// Wait for a run to reach a terminal state, observing the caller's cancel
/// token and an optional wait budget.
async fn join_run(
    state: &Arc<RuntimeState>,
    run_id: &Uuid,
    timeout_seconds: Option<u64>,
    ctx: &ToolContext,
) -> Result<SubagentRun> {
    let registry = &state.subagents;
    let deadline = timeout_seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));

    loop {
        let run = registry
            .get(run_id)
            .ok_or_else(|| tool_err(format!("unknown run: {run_id}")))?;
        if run.state.is_terminal() {
            return Ok(run);
        }
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(tool_err(format!(
                "timed out waiting for run {run_id} (state: {})",
                run.state.as_str()
            )));
        }
        tokio::time::sleep(JOIN_POLL_INTERVAL).await;
    }
}
