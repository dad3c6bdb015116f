//! Runtime configuration.
//!
//! A single immutable `Config` value is constructed at agent creation; where
//! it comes from (TOML file, env, CLI flags) is the embedder's concern. All
//! fields have defaults so a minimal config deserializes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider identifier recorded in session headers (e.g. "anthropic").
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "d_workspace")]
    pub workspace_dir: PathBuf,
    /// Directory holding the per-session journals.
    #[serde(default = "d_sessions")]
    pub sessions_dir: PathBuf,
    /// Role block injected into the system prompt.
    #[serde(default = "d_role")]
    pub role: String,
    #[serde(default)]
    pub stream: bool,
    /// Expose the subagent orchestration tools to the model.
    #[serde(default = "d_true")]
    pub enable_orchestration: bool,
    #[serde(default = "d_3")]
    pub max_retries: u32,
    #[serde(default = "d_retry_base")]
    pub retry_base_seconds: f64,
    /// Global cap on concurrently active lanes.
    #[serde(default = "d_4")]
    pub max_concurrent: usize,
    /// A work item waiting on the global cap longer than this emits a
    /// `lane_wait` event.
    #[serde(default = "d_2000")]
    pub lane_warn_wait_ms: u64,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            workspace_dir: d_workspace(),
            sessions_dir: d_sessions(),
            role: d_role(),
            stream: false,
            enable_orchestration: true,
            max_retries: 3,
            retry_base_seconds: d_retry_base(),
            max_concurrent: 4,
            lane_warn_wait_ms: 2000,
            context: ContextConfig::default(),
            subagents: SubagentConfig::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Chars,
    Tokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "d_mode")]
    pub mode: ContextMode,
    #[serde(default = "d_120000")]
    pub max_chars: usize,
    #[serde(default = "d_30000")]
    pub max_tokens: usize,
    #[serde(default = "d_160000")]
    pub compact_trigger_chars: usize,
    #[serde(default = "d_40000")]
    pub compact_trigger_tokens: usize,
    /// Trimming never drops below this many trailing non-system messages.
    #[serde(default = "d_8")]
    pub keep_last_messages: usize,
    /// Compaction keeps this many trailing messages verbatim.
    #[serde(default = "d_8")]
    pub compact_keep_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: ContextMode::Chars,
            max_chars: 120_000,
            max_tokens: 30_000,
            compact_trigger_chars: 160_000,
            compact_trigger_tokens: 40_000,
            keep_last_messages: 8,
            compact_keep_tail: 8,
        }
    }
}

impl ContextConfig {
    /// The size budget in the active mode's units.
    pub fn max_size(&self) -> usize {
        match self.mode {
            ContextMode::Chars => self.max_chars,
            ContextMode::Tokens => self.max_tokens,
        }
    }

    /// The compaction trigger in the active mode's units.
    pub fn compact_trigger(&self) -> usize {
        match self.mode {
            ContextMode::Chars => self.compact_trigger_chars,
            ContextMode::Tokens => self.compact_trigger_tokens,
        }
    }

    /// Measure a byte count in the active mode's units. Tokens use the
    /// 4-bytes-per-token heuristic; no external tokenizer.
    pub fn measure_bytes(&self, bytes: usize) -> usize {
        match self.mode {
            ContextMode::Chars => bytes,
            ContextMode::Tokens => bytes.div_ceil(4),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(default = "d_2")]
    pub max_depth: u32,
    /// Background worker pool for child runs, separate from `max_concurrent`.
    #[serde(default = "d_4")]
    pub max_workers: usize,
    /// 0 disables the per-run timeout.
    #[serde(default)]
    pub run_timeout_seconds: u64,
    /// Append a system-authored summary to the parent session when a child
    /// run finishes.
    #[serde(default = "d_true")]
    pub announce_completion: bool,
    /// Buffered event tail kept per run, oldest evicted.
    #[serde(default = "d_256")]
    pub event_buffer: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_workers: 4,
            run_timeout_seconds: 0,
            announce_completion: true,
            event_buffer: 256,
        }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_workspace() -> PathBuf {
    PathBuf::from(".")
}
fn d_sessions() -> PathBuf {
    PathBuf::from(".spindle/sessions")
}
fn d_role() -> String {
    "a capable autonomous assistant".to_owned()
}
fn d_mode() -> ContextMode {
    ContextMode::Chars
}
fn d_true() -> bool {
    true
}
fn d_2() -> u32 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_4() -> usize {
    4
}
fn d_8() -> usize {
    8
}
fn d_256() -> usize {
    256
}
fn d_2000() -> u64 {
    2000
}
fn d_retry_base() -> f64 {
    1.0
}
fn d_30000() -> usize {
    30_000
}
fn d_40000() -> usize {
    40_000
}
fn d_120000() -> usize {
    120_000
}
fn d_160000() -> usize {
    160_000
}
