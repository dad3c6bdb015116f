//! Tool dispatch: resolves a tool name to a handler and runs it with a
//! structured result.
//!
//! Built-in orchestration tools (`sessions_spawn`, `subagents`) are matched
//! by name ahead of caller-registered extras. Handler failures never abort
//! the loop; they become tool messages prefixed with [`TOOL_ERROR_PREFIX`].

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use spindle_domain::{Error, Result, ToolDefinition, ToolOutput};

use crate::agent::RuntimeState;
use crate::steering::CancelToken;
use crate::subagents;

/// Every failed tool result starts with this prefix.
pub const TOOL_ERROR_PREFIX: &str = "ERROR: ";

/// Body of the synthetic tool message recorded for a call skipped by
/// steering.
pub const SKIPPED_TOOL_RESULT: &str = "[skipped: interrupted by user steering]";

/// Per-call context handed to tool handlers.
///
/// Handlers must honor `cancel` and return promptly once it trips. Calling
/// `on_progress` emits a `tool_execution_update` event.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub workspace_dir: PathBuf,
    /// Subagent nesting depth of the calling session; 0 for roots.
    pub depth: u32,
    pub cancel: CancelToken,
    pub on_progress: Arc<dyn Fn(&str) + Send + Sync>,
}

/// An executable tool. Implementations live outside the runtime and are
/// registered through the agent builder.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// What the loop records after a dispatch, success or failure.
pub(crate) struct DispatchOutcome {
    pub text: String,
    pub details: Option<Value>,
    pub is_error: bool,
}

/// Built-in tool schemas, filtered by the orchestration switch.
pub(crate) fn builtin_tool_definitions(enable_orchestration: bool) -> Vec<ToolDefinition> {
    if !enable_orchestration {
        return Vec::new();
    }

    vec![
        ToolDefinition {
            name: "sessions_spawn".into(),
            description: "Spawn a subagent to work on a task in its own session. \
                          Returns the run id immediately, or the final answer when wait is true."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string", "description": "The task to give the subagent" },
                    "wait": { "type": "boolean", "description": "Block until the run finishes" },
                    "timeout_seconds": { "type": "integer", "description": "Max seconds to wait when wait is true" }
                },
                "required": ["task"]
            }),
        },
        ToolDefinition {
            name: "subagents".into(),
            description: "Manage spawned subagent runs: list, get_result, events, steer, kill.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["list", "get_result", "events", "steer", "kill"],
                        "description": "Action to perform"
                    },
                    "run_id": { "type": "string", "description": "Run id (required for all actions except list)" },
                    "text": { "type": "string", "description": "Steering message (steer action)" },
                    "wait": { "type": "boolean", "description": "Block until terminal (get_result action)" }
                },
                "required": ["action"]
            }),
        },
    ]
}

/// Dispatch a single tool call. Failures are captured, not propagated.
pub(crate) async fn dispatch_tool(
    state: &Arc<RuntimeState>,
    name: &str,
    arguments: &Value,
    ctx: &ToolContext,
) -> DispatchOutcome {
    let handled_builtin = state.config.enable_orchestration
        && !state.extra_tools.contains_key(name)
        && matches!(name, "sessions_spawn" | "subagents");

    let result = if handled_builtin {
        match name {
            "sessions_spawn" => subagents::tool_spawn(state, arguments, ctx).await,
            _ => subagents::tool_manage(state, arguments, ctx).await,
        }
    } else if let Some((_, handler)) = state.extra_tools.get(name) {
        handler.execute(arguments.clone(), ctx).await
    } else {
        Err(Error::Tool {
            name: name.to_owned(),
            message: "unknown tool".into(),
        })
    };

    match result {
        Ok(output) => DispatchOutcome {
            text: output.text,
            details: output.details,
            is_error: false,
        },
        Err(e) => {
            tracing::warn!(tool = name, error = %e, "tool execution failed");
            DispatchOutcome {
                text: format!("{TOOL_ERROR_PREFIX}{e}"),
                details: Some(serde_json::json!({ "kind": "error" })),
                is_error: true,
            }
        }
    }
}
