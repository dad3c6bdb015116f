//! The LLM provider contract.
//!
//! Concrete adapters (HTTP clients for specific vendors) live outside this
//! workspace; the runtime only depends on this trait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tool::ToolDefinition;

/// Token usage reported for one completion. Fields map directly onto the
/// session header counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// One request to the provider.
#[derive(Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    /// Per-turn credential, resolved through the `get_api_key` hook when one
    /// is installed. Adapters with their own credential handling ignore it.
    pub api_key: Option<String>,
}

/// The provider's answer: a full assistant message (text and/or tool calls)
/// plus usage when the vendor reports it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: Message,
    pub usage: Option<Usage>,
}

/// Receives incremental text while a completion streams.
pub type TextDeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// How a provider failure should be handled by the retry policy.
///
/// Classification is the adapter's responsibility. The documented mapping:
/// timeouts, connection resets, HTTP 429 and 5xx are `Transient`; auth
/// failures, malformed requests and everything else are `Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("provider error ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// A remote LLM endpoint.
///
/// `complete` returns the full assistant message. When `stream` is given the
/// adapter should additionally push text chunks through it as they arrive;
/// adapters that do not stream may ignore it.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        stream: Option<TextDeltaSink>,
    ) -> Result<Completion, ProviderError>;
}
