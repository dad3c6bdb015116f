//! Shared domain types for Spindle.
//!
//! Everything the runtime, the session store, and external collaborators
//! (provider adapters, tool handlers, event consumers) agree on lives here:
//! messages, tool calls, lifecycle events, the provider contract, the shared
//! error type, and the immutable runtime configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

pub use config::{Config, ContextConfig, ContextMode, SubagentConfig};
pub use error::{Error, Result};
pub use event::{AgentEvent, TurnStatus};
pub use message::{Message, Role, Source};
pub use provider::{
    Completion, CompletionRequest, Provider, ProviderError, ProviderErrorKind, TextDeltaSink,
    Usage,
};
pub use tool::{ToolCall, ToolDefinition, ToolOutput};
