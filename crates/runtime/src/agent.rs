//! The public agent surface: configuration wiring, per-session steering,
//! and the entry points that hand work to the lane queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use spindle_domain::{Config, Error, Message, Provider, Result, Role, ToolDefinition};
use spindle_sessions::{SessionSeed, SessionStore};

use crate::context::ContextManager;
use crate::events::{EventBus, EventSink};
use crate::lanes::{BoxedWork, LaneQueue, WaitCallback};
use crate::prompt::PromptParts;
use crate::steering::SteeringController;
use crate::subagents::SubagentRegistry;
use crate::tools::ToolHandler;
use crate::turn::{self, RunOutcome, RunParams};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type MessagesHook = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;
pub type BeforeTurnHook = Arc<dyn Fn(u32, PromptParts) -> PromptParts + Send + Sync>;
pub type ApiKeyHook = Arc<dyn Fn() -> Option<String> + Send + Sync>;
pub type TextDeltaCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional callbacks threaded through the loop.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Runs between the session snapshot and context management.
    pub transform_context: Option<MessagesHook>,
    /// Runs between context management and the provider call.
    pub convert_to_llm: Option<MessagesHook>,
    /// May replace the prompt and tool descriptors for one round.
    pub before_turn: Option<BeforeTurnHook>,
    /// Resolves a per-turn provider credential.
    pub get_api_key: Option<ApiKeyHook>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a run needs, shared across the loop, the dispatcher, and the
/// subagent registry.
pub struct RuntimeState {
    pub config: Config,
    pub provider: Arc<dyn Provider>,
    pub store: Arc<SessionStore>,
    pub lanes: Arc<LaneQueue>,
    pub subagents: SubagentRegistry,
    pub context: ContextManager,
    pub extra_tools: HashMap<String, (ToolDefinition, Arc<dyn ToolHandler>)>,
    pub sink: Option<Arc<dyn EventSink>>,
    pub on_text_delta: Option<TextDeltaCallback>,
    pub hooks: Hooks,
    steering: Mutex<HashMap<String, Arc<SteeringController>>>,
}

impl RuntimeState {
    /// The steering controller for a session, created on first use so that
    /// steers enqueued between runs still apply.
    pub(crate) fn controller(&self, session_id: &str) -> Arc<SteeringController> {
        self.steering
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    pub(crate) fn extra_defs(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.extra_tools.values().map(|(def, _)| def.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentBuilder {
    config: Config,
    provider: Option<Arc<dyn Provider>>,
    sink: Option<Arc<dyn EventSink>>,
    on_text_delta: Option<TextDeltaCallback>,
    hooks: Hooks,
    extra_tools: HashMap<String, (ToolDefinition, Arc<dyn ToolHandler>)>,
}

impl AgentBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            provider: None,
            sink: None,
            on_text_delta: None,
            hooks: Hooks::default(),
            extra_tools: HashMap::new(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn on_event(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn on_text_delta(mut self, cb: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_text_delta = Some(Arc::new(cb));
        self
    }

    pub fn transform_context(
        mut self,
        hook: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.transform_context = Some(Arc::new(hook));
        self
    }

    pub fn convert_to_llm(
        mut self,
        hook: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.convert_to_llm = Some(Arc::new(hook));
        self
    }

    pub fn before_turn(
        mut self,
        hook: impl Fn(u32, PromptParts) -> PromptParts + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_turn = Some(Arc::new(hook));
        self
    }

    pub fn get_api_key(mut self, hook: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.hooks.get_api_key = Some(Arc::new(hook));
        self
    }

    /// Register an extra tool. Last registration wins on duplicate names;
    /// collisions with built-in tools are resolved per round in the prompt
    /// builder (the extra wins, with a warning event).
    pub fn extra_tool(mut self, def: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        self.extra_tools.insert(def.name.clone(), (def, handler));
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| Error::Config("a provider is required".into()))?;

        let seed = SessionSeed {
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            workspace_dir: self.config.workspace_dir.clone(),
        };
        let store = Arc::new(SessionStore::new(&self.config.sessions_dir, seed)?);
        let lanes = Arc::new(LaneQueue::new(
            self.config.max_concurrent,
            self.config.lane_warn_wait_ms,
        ));
        let subagents = SubagentRegistry::new(&self.config.subagents);
        let context = ContextManager::new(self.config.context.clone());

        Ok(Agent {
            state: Arc::new(RuntimeState {
                config: self.config,
                provider,
                store,
                lanes,
                subagents,
                context,
                extra_tools: self.extra_tools,
                sink: self.sink,
                on_text_delta: self.on_text_delta,
                hooks: self.hooks,
                steering: Mutex::new(HashMap::new()),
            }),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A configured runtime. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Agent {
    state: Arc<RuntimeState>,
}

impl Agent {
    pub fn builder(config: Config) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Submit a user message to a session and drive the loop to a terminal
    /// state. Runs for the same session execute in submission order.
    pub async fn chat(&self, session_id: &str, text: &str) -> Result<RunOutcome> {
        self.run(session_id, Some(Message::user(text))).await
    }

    /// Re-enter the loop on the existing history, without a new user
    /// message. Valid only when the session's last message has role `user`
    /// or `tool`.
    pub async fn continue_run(&self, session_id: &str) -> Result<RunOutcome> {
        match self.state.store.last_role(session_id)? {
            Some(Role::User | Role::Tool) => self.run(session_id, None).await,
            other => Err(Error::InvalidState(format!(
                "continue_run requires a trailing user or tool message, found {other:?}"
            ))),
        }
    }

    async fn run(&self, session_id: &str, initial: Option<Message>) -> Result<RunOutcome> {
        let controller = self.state.controller(session_id);
        let cancel = controller.register_token();
        let bus = Arc::new(EventBus::new(
            self.state.sink.iter().cloned().collect(),
        ));

        let wait_cb: Option<WaitCallback> = {
            let bus = bus.clone();
            let sid = session_id.to_owned();
            Some(Arc::new(move |waited_ms| {
                bus.emit(spindle_domain::AgentEvent::LaneWait {
                    session_id: sid.clone(),
                    waited_ms,
                });
            }))
        };

        let params = RunParams {
            session_id: session_id.to_owned(),
            depth: 0,
            initial_message: initial,
        };
        let work: BoxedWork<Result<RunOutcome>> = Box::pin(turn::run_loop(
            self.state.clone(),
            params,
            controller.clone(),
            cancel.clone(),
            bus,
        ));

        let handle = self
            .state
            .lanes
            .submit(session_id, cancel.clone(), wait_cb, work);
        let result = handle.await;
        controller.release_token(&cancel);
        match result {
            Ok(outcome) => outcome,
            // Cancelled while still queued: the item was removed silently.
            Err(_) => Ok(RunOutcome::cancelled(None)),
        }
    }

    /// Interrupt the session's in-flight tool batch with a user message.
    pub fn steer(&self, session_id: &str, text: impl Into<String>) {
        self.state.controller(session_id).steer(text);
    }

    /// Queue a user message that fires when the loop would otherwise return.
    pub fn follow_up(&self, session_id: &str, text: impl Into<String>) {
        self.state.controller(session_id).follow_up(text);
    }

    /// Cancel the session's queued and running work.
    pub fn cancel(&self, session_id: &str) {
        self.state.controller(session_id).cancel();
    }

    pub fn clear_steering_queue(&self, session_id: &str) {
        self.state.controller(session_id).clear_steering_queue();
    }

    pub fn clear_follow_up_queue(&self, session_id: &str) {
        self.state.controller(session_id).clear_follow_up_queue();
    }

    pub fn clear_all_queues(&self, session_id: &str) {
        self.state.controller(session_id).clear_all_queues();
    }

    pub fn subagents(&self) -> &SubagentRegistry {
        &self.state.subagents
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.state.store
    }
}
