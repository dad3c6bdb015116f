//! Context management: keeps the message view sent to the provider inside a
//! size budget.
//!
//! Two passes over a session snapshot:
//!
//! 1. **Trim**: drop the oldest non-system messages until the view fits, or
//!    only `keep_last_messages` remain. An assistant message and its tool
//!    results form one group and drop together, so trimming never orphans a
//!    tool call or a tool result.
//! 2. **Compact**: when trimming cannot reach the budget, or the full
//!    history crossed the compaction trigger, everything older than the last
//!    `compact_keep_tail` messages is replaced by one deterministic summary
//!    message (`source = compaction`), persisted through an atomic journal
//!    prefix rewrite.
//!
//! Compaction is idempotent: an already-compacted history that fits the
//! budget passes through unchanged.

use std::collections::HashSet;

use spindle_domain::{ContextConfig, ContextMode, Message, Result, Role, Source};
use spindle_sessions::SessionStore;

use crate::truncate_str;

/// Per-message preview length used in compaction summaries.
const SUMMARY_PREVIEW_CHARS: usize = 80;

pub struct ContextManager {
    cfg: ContextConfig,
}

impl ContextManager {
    pub fn new(cfg: ContextConfig) -> Self {
        Self { cfg }
    }

    /// Produce the message view for one round.
    ///
    /// `messages` is the session snapshot, possibly reshaped by a
    /// `transform_context` hook. `allow_persist` must be false when the hook
    /// changed the message count; the summary then only appears in the
    /// returned view and the journal is left alone.
    pub fn prepare(
        &self,
        store: &SessionStore,
        session_id: &str,
        messages: Vec<Message>,
        allow_persist: bool,
    ) -> Result<Vec<Message>> {
        let total = self.measure(&messages);
        let max = self.cfg.max_size();
        if total <= max {
            return Ok(messages);
        }

        let trimmed = self.trim(&messages);
        if self.measure(&trimmed) <= max && total <= self.cfg.compact_trigger() {
            return Ok(trimmed);
        }

        let tail_start = tail_boundary(&messages, self.cfg.compact_keep_tail);
        if tail_start == 0 {
            // Nothing older than the protected tail; trimming is all we have.
            return Ok(trimmed);
        }

        let summary = self.summarize(&messages[..tail_start]);
        if allow_persist {
            store.replace_prefix(session_id, tail_start, summary.clone())?;
            tracing::info!(
                session_id,
                compacted = tail_start,
                kept = messages.len() - tail_start,
                "session history compacted"
            );
        }

        let mut view = Vec::with_capacity(messages.len() - tail_start + 1);
        view.push(summary);
        view.extend_from_slice(&messages[tail_start..]);
        if self.measure(&view) > max {
            view = self.trim(&view);
        }
        Ok(view)
    }

    fn measure(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.cfg.measure_bytes(m.size_bytes()))
            .sum()
    }

    /// Drop oldest non-system messages, whole tool groups at a time, until
    /// the view fits or only `keep_last_messages` non-system messages
    /// remain. A group that crosses the floor still drops together.
    fn trim(&self, messages: &[Message]) -> Vec<Message> {
        let max = self.cfg.max_size();
        let mut keep = vec![true; messages.len()];
        let mut total = self.measure(messages);
        let mut non_system = messages.iter().filter(|m| m.role != Role::System).count();

        let mut i = 0;
        while total > max && non_system > self.cfg.keep_last_messages && i < messages.len() {
            if messages[i].role == Role::System {
                i += 1;
                continue;
            }
            let end = group_end(messages, i);
            for k in i..end {
                if messages[k].role == Role::System {
                    continue;
                }
                keep[k] = false;
                total -= self.cfg.measure_bytes(messages[k].size_bytes());
                non_system -= 1;
            }
            i = end;
        }

        messages
            .iter()
            .zip(keep)
            .filter_map(|(m, k)| k.then(|| m.clone()))
            .collect()
    }

    /// Deterministic summary of a message prefix: a stable role + preview
    /// concatenation, truncated to a quarter of the size budget.
    fn summarize(&self, prefix: &[Message]) -> Message {
        let mut parts = Vec::with_capacity(prefix.len());
        for msg in prefix {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            parts.push(format!("{role}: {}", truncate_str(&msg.content, SUMMARY_PREVIEW_CHARS)));
        }
        let unit_bytes = match self.cfg.mode {
            ContextMode::Chars => 1,
            ContextMode::Tokens => 4,
        };
        let cap = (self.cfg.max_size() * unit_bytes / 4).max(64);
        let body = truncate_str(&parts.join("\n"), cap);
        Message::system(format!("[compacted {} earlier messages]\n{body}", prefix.len()))
            .with_source(Source::Compaction)
    }
}

/// Index of the first message kept verbatim by compaction. Widened backward
/// so the tail never starts on a tool result whose call sits in the prefix.
fn tail_boundary(messages: &[Message], keep_tail: usize) -> usize {
    let mut start = messages.len().saturating_sub(keep_tail);
    while start > 0 && messages[start].role == Role::Tool {
        start -= 1;
    }
    start
}

/// End (exclusive) of the droppable group starting at `i`: an assistant
/// message with tool calls owns the tool results that follow it.
fn group_end(messages: &[Message], i: usize) -> usize {
    if !messages[i].has_tool_calls() {
        return i + 1;
    }
    let ids: HashSet<&str> = messages[i]
        .tool_calls
        .iter()
        .flatten()
        .map(|tc| tc.id.as_str())
        .collect();
    let mut j = i + 1;
    while j < messages.len()
        && messages[j].role == Role::Tool
        && messages[j]
            .tool_call_id
            .as_deref()
            .is_some_and(|id| ids.contains(id))
    {
        j += 1;
    }
    j
}
