//! The Spindle runtime: a reactive loop over sessions, tools, and an LLM
//! provider.
//!
//! Entry point: build an [`Agent`] with a [`Config`](spindle_domain::Config)
//! and a provider, then drive sessions with [`Agent::chat`]. Runs for one
//! session are serialized on a lane; global concurrency is capped. External
//! threads can [`steer`](Agent::steer), [`follow_up`](Agent::follow_up), or
//! [`cancel`](Agent::cancel) a session while it runs, and spawned subagents
//! are tracked in the [`SubagentRegistry`].

pub mod agent;
pub mod context;
pub mod events;
pub mod lanes;
pub mod prompt;
pub mod steering;
pub mod subagents;
pub mod tools;
pub mod turn;

pub use agent::{Agent, AgentBuilder, Hooks};
pub use context::ContextManager;
pub use events::EventSink;
pub use lanes::LaneQueue;
pub use prompt::PromptParts;
pub use steering::{CancelToken, SteeringController};
pub use subagents::{RunState, SubagentRegistry, SubagentRun};
pub use tools::{ToolContext, ToolHandler, SKIPPED_TOOL_RESULT, TOOL_ERROR_PREFIX};
pub use turn::{RunEndStatus, RunOutcome};

/// Truncate to a byte budget on a char boundary, marking the cut with "...".
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Preview length used in events and announcements.
pub(crate) fn preview(s: &str) -> String {
    truncate_str(s, 200)
}
