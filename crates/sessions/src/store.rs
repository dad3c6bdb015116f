//! The session store.
//!
//! Keeps an in-memory mirror of every opened journal behind per-session
//! locks. Writes go to disk before the call returns; readers clone
//! snapshots. Missing sessions auto-initialize on first access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use spindle_domain::{Error, Message, Result, Usage};

use crate::journal;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Header
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The journal's leading record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub workspace_dir: PathBuf,
    /// Cumulative usage across all turns of the session.
    #[serde(default)]
    pub usage: Usage,
    /// Set when the session was spawned as a subagent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

/// Defaults stamped into the header of a newly created session.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub provider: String,
    pub model: String,
    pub workspace_dir: PathBuf,
}

impl SessionSeed {
    fn header(&self, session_id: &str, parent_session_id: Option<String>) -> SessionHeader {
        SessionHeader {
            session_id: session_id.to_owned(),
            created_at: Utc::now(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            workspace_dir: self.workspace_dir.clone(),
            usage: Usage::default(),
            parent_session_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionState {
    header: SessionHeader,
    messages: Vec<Message>,
}

/// Sole writer of session journals. One in-memory state per session; the
/// per-session lock makes journal rewrites invisible to readers (they see
/// either the pre- or the post-rewrite state).
pub struct SessionStore {
    base_dir: PathBuf,
    seed: SessionSeed,
    sessions: RwLock<HashMap<String, Arc<RwLock<SessionState>>>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>, seed: SessionSeed) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(Error::Io)?;
        Ok(Self {
            base_dir,
            seed,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Open a session, creating it (journal with header line) when missing.
    pub fn open(&self, session_id: &str) -> Result<SessionHeader> {
        Ok(self.cell(session_id, None)?.read().header.clone())
    }

    /// Open a child session, recording its parent in the header. Only
    /// meaningful on first creation; an existing session keeps its header.
    pub fn open_child(&self, session_id: &str, parent_session_id: &str) -> Result<SessionHeader> {
        Ok(self
            .cell(session_id, Some(parent_session_id.to_owned()))?
            .read()
            .header
            .clone())
    }

    /// Append one message. Flushed to the journal before returning.
    pub fn append(&self, session_id: &str, message: Message) -> Result<()> {
        let cell = self.cell(session_id, None)?;
        let mut state = cell.write();
        journal::append(&self.path(session_id), &message)?;
        state.messages.push(message);
        Ok(())
    }

    /// Immutable snapshot of the session's messages.
    pub fn snapshot(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.cell(session_id, None)?.read().messages.clone())
    }

    pub fn message_count(&self, session_id: &str) -> Result<usize> {
        Ok(self.cell(session_id, None)?.read().messages.len())
    }

    /// Role of the last message, if any. Used to validate `continue_run`.
    pub fn last_role(&self, session_id: &str) -> Result<Option<spindle_domain::Role>> {
        Ok(self
            .cell(session_id, None)?
            .read()
            .messages
            .last()
            .map(|m| m.role))
    }

    /// Replace `messages[..up_to_index]` with a single summary message.
    ///
    /// The journal is rewritten to a temporary file and atomically renamed;
    /// in-memory readers are blocked for the duration, so no torn views.
    pub fn replace_prefix(
        &self,
        session_id: &str,
        up_to_index: usize,
        summary: Message,
    ) -> Result<()> {
        let cell = self.cell(session_id, None)?;
        let mut state = cell.write();
        let up_to_index = up_to_index.min(state.messages.len());

        let mut rewritten = Vec::with_capacity(state.messages.len() - up_to_index + 1);
        rewritten.push(summary);
        rewritten.extend_from_slice(&state.messages[up_to_index..]);

        journal::rewrite(&self.path(session_id), &state.header, &rewritten)?;
        state.messages = rewritten;

        tracing::debug!(
            session_id,
            replaced = up_to_index,
            remaining = state.messages.len(),
            "journal prefix replaced"
        );
        Ok(())
    }

    /// Patch the header and persist it (full journal rewrite).
    pub fn update_header<F>(&self, session_id: &str, patch: F) -> Result<()>
    where
        F: FnOnce(&mut SessionHeader),
    {
        let cell = self.cell(session_id, None)?;
        let mut state = cell.write();
        patch(&mut state.header);
        journal::rewrite(&self.path(session_id), &state.header, &state.messages)
    }

    /// Add a usage delta to the header counters.
    pub fn record_usage(&self, session_id: &str, delta: &Usage) -> Result<()> {
        self.update_header(session_id, |h| h.usage.add(delta))
    }

    /// Headers of every session the store knows about, on disk or cached.
    pub fn list(&self) -> Vec<SessionHeader> {
        let mut ids: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.base_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(id) = name.strip_suffix(".jsonl") {
                    ids.push(id.to_owned());
                }
            }
        }
        ids.sort();
        ids.iter()
            .filter_map(|id| self.open(id).ok())
            .collect()
    }

    fn path(&self, session_id: &str) -> PathBuf {
        journal::journal_path(&self.base_dir, session_id)
    }

    fn cell(
        &self,
        session_id: &str,
        parent_session_id: Option<String>,
    ) -> Result<Arc<RwLock<SessionState>>> {
        if session_id.is_empty() {
            return Err(Error::InvalidState("empty session id".into()));
        }

        // Fast path: already cached.
        {
            let sessions = self.sessions.read();
            if let Some(cell) = sessions.get(session_id) {
                return Ok(cell.clone());
            }
        }

        // Slow path: load from disk or create.
        let path = self.path(session_id);
        let state = match journal::load(&path)? {
            Some((header, messages)) => SessionState { header, messages },
            None => {
                let header = self.seed.header(session_id, parent_session_id);
                journal::init(&path, &header)?;
                SessionState {
                    header,
                    messages: Vec::new(),
                }
            }
        };

        let mut sessions = self.sessions.write();
        // Another caller may have raced us here; keep the first insert.
        let cell = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(state)))
            .clone();
        Ok(cell)
    }
}
