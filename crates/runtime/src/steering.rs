//! Steering: thread-safe interrupt and follow-up queues, plus cancellation.
//!
//! Each session has one [`SteeringController`], shared between the external
//! threads that enqueue messages and the reactive loop that drains them at
//! its safe points. A `steer` preempts the in-flight tool batch; a
//! `follow_up` fires only when the loop would otherwise terminate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelToken
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cancellation token checked by the loop at every safe point and handed
/// to provider calls and tool handlers.
///
/// The flag is a plain atomic; the paired [`Notify`] lets backoff sleeps
/// race cancellation instead of polling.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve when the token is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SteeringController
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session steering state: two FIFOs plus the cancel tokens of the
/// session's queued and running work.
pub struct SteeringController {
    steer_queue: Mutex<VecDeque<String>>,
    follow_up_queue: Mutex<VecDeque<String>>,
    /// Tokens registered by work submitted for this session. `cancel()`
    /// trips them all: a running loop stops at its next safe point, a
    /// queued-but-not-started item is dropped silently by its lane.
    tokens: Mutex<Vec<CancelToken>>,
}

impl SteeringController {
    pub fn new() -> Self {
        Self {
            steer_queue: Mutex::new(VecDeque::new()),
            follow_up_queue: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue an interrupt message. Consulted before each tool call and at
    /// terminal rounds.
    pub fn steer(&self, text: impl Into<String>) {
        self.steer_queue.lock().push_back(text.into());
    }

    /// Enqueue a terminal-only message. Consulted only when the loop is
    /// about to return.
    pub fn follow_up(&self, text: impl Into<String>) {
        self.follow_up_queue.lock().push_back(text.into());
    }

    pub fn clear_steering_queue(&self) {
        self.steer_queue.lock().clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.follow_up_queue.lock().clear();
    }

    pub fn clear_all_queues(&self) {
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    /// Cancel all work registered for this session. A no-op when nothing is
    /// registered.
    pub fn cancel(&self) {
        for token in self.tokens.lock().iter() {
            token.cancel();
        }
    }

    /// Queues are drained one message per check.
    pub(crate) fn take_steer(&self) -> Option<String> {
        self.steer_queue.lock().pop_front()
    }

    pub(crate) fn take_follow_up(&self) -> Option<String> {
        self.follow_up_queue.lock().pop_front()
    }

    pub(crate) fn has_pending_steer(&self) -> bool {
        !self.steer_queue.lock().is_empty()
    }

    /// Register a fresh token for a submitted piece of work.
    pub(crate) fn register_token(&self) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().push(token.clone());
        token
    }

    /// Drop a finished token from the registry.
    pub(crate) fn release_token(&self, token: &CancelToken) {
        self.tokens
            .lock()
            .retain(|t| !Arc::ptr_eq(&t.inner, &token.inner));
    }
}

impl Default for SteeringController {
    fn default() -> Self {
        Self::new()
    }
}
