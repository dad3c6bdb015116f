//! Lifecycle events emitted by the runtime.
//!
//! Events are plain serializable records with a mandatory `type` tag.
//! Canonical per-run order:
//!
//! ```text
//! agent_start
//!   (per round)
//!     turn_start
//!     message_start{user|assistant} ... message_end
//!     [per tool call: tool_execution_start, *_update..., tool_execution_end]
//!     turn_end
//! agent_end
//! ```
//!
//! Every `*_start` is paired with exactly one matching `*_end`, including
//! tool calls skipped by steering (`skipped = true` on both). Consumers must
//! tolerate unknown payload keys.

use serde::{Deserialize, Serialize};

use crate::message::Role;

/// Why a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    ToolCallsProcessed,
    Steered,
    FollowUpInjected,
    Cancelled,
    Failed,
    LoopDetected,
}

impl TurnStatus {
    /// Statuses that end the whole run, not just the round.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::LoopDetected
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart {
        session_id: String,
    },
    TurnStart {
        round: u32,
    },
    MessageStart {
        role: Role,
        round: u32,
    },
    /// Emitted only when streaming is enabled.
    MessageUpdate {
        delta: String,
    },
    MessageEnd {
        role: Role,
        text_preview: String,
    },
    ToolExecutionStart {
        call_id: String,
        name: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
    },
    ToolExecutionUpdate {
        call_id: String,
        text: String,
    },
    ToolExecutionEnd {
        call_id: String,
        name: String,
        result_preview: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
        /// Opaque handler details, passed through verbatim.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    TurnEnd {
        round: u32,
        status: TurnStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        assistant_message_preview: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_results_preview: Option<String>,
    },
    AgentEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        final_text: Option<String>,
    },
    /// A work item waited on the global concurrency cap beyond the
    /// configured threshold.
    LaneWait {
        session_id: String,
        waited_ms: u64,
    },
    Warning {
        message: String,
    },
}
