//! The event bus: fans lifecycle events out to the configured sink.
//!
//! Each run emits from a single worker, so per-run event order matches
//! emission order even for sinks that are not thread-safe internally. Sink
//! panics are caught and discarded; they never affect the run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use spindle_domain::AgentEvent;

/// A lifecycle event consumer. Handlers must be non-blocking; the runtime
/// invokes them inline from whichever worker produced the event.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &AgentEvent);
}

impl<F> EventSink for F
where
    F: Fn(&AgentEvent) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) {
        self(event)
    }
}

/// The per-run fan-out point. A run's bus carries the agent-level sink, a
/// subagent ring buffer, or both.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn emit(&self, event: AgentEvent) {
        for sink in &self.sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.on_event(&event))).is_err() {
                tracing::warn!("event sink panicked; event discarded");
            }
        }
    }
}
