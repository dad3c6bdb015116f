//! The reactive loop: rounds of provider call, tool batch, result
//! injection, until the model answers with plain text.
//!
//! One invocation of [`run_loop`] is one *run*: it emits `agent_start`,
//! drives rounds until a terminal status, then emits `agent_end`. Steering
//! is consulted before every tool call; follow-ups are consulted when a
//! round would otherwise be terminal. A loop guard aborts after three
//! consecutive identical rounds.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::Instrument;

use spindle_domain::{
    AgentEvent, Completion, CompletionRequest, Error, Message, ProviderError, Result, Role,
    Source, TextDeltaSink, ToolCall, TurnStatus,
};

use crate::agent::RuntimeState;
use crate::events::EventBus;
use crate::preview;
use crate::steering::{CancelToken, SteeringController};
use crate::tools::{self, ToolContext, SKIPPED_TOOL_RESULT};

/// Consecutive identical rounds tolerated before the guard trips.
const LOOP_GUARD_LIMIT: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEndStatus {
    Completed,
    Cancelled,
    LoopDetected,
}

/// How a run ended, with the last assistant text when there was one.
/// Failures (storage, exhausted or fatal provider) surface as `Err` from
/// [`run_loop`] instead.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunEndStatus,
    pub final_text: Option<String>,
}

impl RunOutcome {
    fn completed(text: String) -> Self {
        Self {
            status: RunEndStatus::Completed,
            final_text: Some(text),
        }
    }

    pub(crate) fn cancelled(final_text: Option<String>) -> Self {
        Self {
            status: RunEndStatus::Cancelled,
            final_text,
        }
    }

    fn loop_detected(text: String) -> Self {
        Self {
            status: RunEndStatus::LoopDetected,
            final_text: Some(text),
        }
    }
}

pub(crate) struct RunParams {
    pub session_id: String,
    pub depth: u32,
    /// The user message that starts the run; `None` re-enters the loop on
    /// the existing history (`continue_run`).
    pub initial_message: Option<Message>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive one run to a terminal state. The event stream always closes with
/// `agent_end`, on success and on error alike.
pub(crate) async fn run_loop(
    state: Arc<RuntimeState>,
    params: RunParams,
    steering: Arc<SteeringController>,
    cancel: CancelToken,
    bus: Arc<EventBus>,
) -> Result<RunOutcome> {
    let span = tracing::info_span!(
        "run",
        session_id = %params.session_id,
        depth = params.depth,
    );
    bus.emit(AgentEvent::AgentStart {
        session_id: params.session_id.clone(),
    });

    let result = run_loop_inner(&state, params, &steering, &cancel, &bus)
        .instrument(span)
        .await;

    let final_text = match &result {
        Ok(outcome) => outcome.final_text.clone(),
        Err(_) => None,
    };
    bus.emit(AgentEvent::AgentEnd { final_text });
    result
}

async fn run_loop_inner(
    state: &Arc<RuntimeState>,
    params: RunParams,
    steering: &Arc<SteeringController>,
    cancel: &CancelToken,
    bus: &Arc<EventBus>,
) -> Result<RunOutcome> {
    let session_id = params.session_id;
    let mut pending_user = params.initial_message;
    let mut round: u32 = 0;
    let mut last_text = String::new();
    let mut last_signature: Option<[u8; 32]> = None;
    let mut signature_repeats: u32 = 0;

    loop {
        // Safe point: before the round opens. No turn events are emitted
        // for a round that never starts.
        if cancel.is_cancelled() {
            return Ok(RunOutcome::cancelled(none_if_empty(&last_text)));
        }

        round += 1;
        bus.emit(AgentEvent::TurnStart { round });

        // Inject the pending user message (initial, steer, or follow-up).
        if let Some(msg) = pending_user.take() {
            bus.emit(AgentEvent::MessageStart {
                role: Role::User,
                round,
            });
            let text_preview = preview(&msg.content);
            if let Err(e) = state.store.append(&session_id, msg) {
                return fail_round(bus, round, e);
            }
            bus.emit(AgentEvent::MessageEnd {
                role: Role::User,
                text_preview,
            });
        }

        // Context view: snapshot, transform hook, trim/compact.
        let snapshot = match state.store.snapshot(&session_id) {
            Ok(s) => s,
            Err(e) => return fail_round(bus, round, e),
        };
        let journal_len = snapshot.len();
        let transformed = match &state.hooks.transform_context {
            Some(hook) => hook(snapshot),
            None => snapshot,
        };
        let allow_persist = transformed.len() == journal_len;
        let view = match state
            .context
            .prepare(&state.store, &session_id, transformed, allow_persist)
        {
            Ok(v) => v,
            Err(e) => return fail_round(bus, round, e),
        };

        // Prompt and tool descriptors, with the per-round override hook.
        let mut parts = crate::prompt::build_prompt(&state.config, &state.extra_defs(), bus);
        if let Some(hook) = &state.hooks.before_turn {
            parts = hook(round, parts);
        }

        let mut llm_messages = Vec::with_capacity(view.len() + 1);
        llm_messages.push(Message::system(parts.system_prompt));
        llm_messages.extend(view);
        let llm_messages = match &state.hooks.convert_to_llm {
            Some(hook) => hook(llm_messages),
            None => llm_messages,
        };

        // Provider call. The assistant message span opens first so that
        // streamed deltas land inside it.
        bus.emit(AgentEvent::MessageStart {
            role: Role::Assistant,
            round,
        });
        let completion =
            match call_provider(state, bus, llm_messages, parts.tools, cancel).await {
                ProviderCall::Ok(completion) => completion,
                ProviderCall::Cancelled => {
                    bus.emit(AgentEvent::MessageEnd {
                        role: Role::Assistant,
                        text_preview: String::new(),
                    });
                    emit_turn_end(bus, round, TurnStatus::Cancelled);
                    return Ok(RunOutcome::cancelled(none_if_empty(&last_text)));
                }
                ProviderCall::Failed(e) => {
                    bus.emit(AgentEvent::MessageEnd {
                        role: Role::Assistant,
                        text_preview: String::new(),
                    });
                    emit_turn_end(bus, round, TurnStatus::Failed);
                    return Err(e.into());
                }
            };

        let assistant = completion.message;
        let assistant_text = assistant.content.clone();
        let calls: Vec<ToolCall> = assistant.tool_calls.clone().unwrap_or_default();
        bus.emit(AgentEvent::MessageEnd {
            role: Role::Assistant,
            text_preview: preview(&assistant_text),
        });

        if let Err(e) = state.store.append(&session_id, assistant) {
            return fail_round(bus, round, e);
        }
        if let Some(usage) = &completion.usage {
            if let Err(e) = state.store.record_usage(&session_id, usage) {
                return fail_round(bus, round, e);
            }
        }
        last_text = assistant_text.clone();

        // Loop guard: the same assistant text plus the same tool-call
        // signature, three rounds in a row.
        let signature = round_signature(&assistant_text, &calls);
        if last_signature == Some(signature) {
            signature_repeats += 1;
        } else {
            last_signature = Some(signature);
            signature_repeats = 1;
        }
        if signature_repeats >= LOOP_GUARD_LIMIT {
            tracing::warn!(session_id = %session_id, round, "loop guard tripped");
            bus.emit(AgentEvent::TurnEnd {
                round,
                status: TurnStatus::LoopDetected,
                tool_calls_count: Some(calls.len()),
                assistant_message_preview: Some(preview(&assistant_text)),
                tool_results_preview: None,
            });
            return Ok(RunOutcome::loop_detected(last_text));
        }

        // Terminal round: plain text, no tool calls.
        if calls.is_empty() {
            if let Some(text) = steering.take_steer() {
                pending_user = Some(Message::user(text).with_source(Source::Steer));
                emit_turn_end(bus, round, TurnStatus::Steered);
                continue;
            }
            if let Some(text) = steering.take_follow_up() {
                pending_user = Some(Message::user(text).with_source(Source::FollowUp));
                emit_turn_end(bus, round, TurnStatus::FollowUpInjected);
                continue;
            }
            bus.emit(AgentEvent::TurnEnd {
                round,
                status: TurnStatus::Completed,
                tool_calls_count: None,
                assistant_message_preview: Some(preview(&assistant_text)),
                tool_results_preview: None,
            });
            return Ok(RunOutcome::completed(last_text));
        }

        // Tool batch, in the order the model emitted the calls.
        let mut result_previews = Vec::with_capacity(calls.len());
        let mut steered = false;
        for (idx, call) in calls.iter().enumerate() {
            // Safe point: cancellation before each dispatch. Remaining
            // calls still receive (skipped) results so tool pairing holds.
            if cancel.is_cancelled() {
                if let Err(e) = skip_remaining(state, bus, &session_id, &calls[idx..]) {
                    return fail_round(bus, round, e);
                }
                emit_turn_end(bus, round, TurnStatus::Cancelled);
                return Ok(RunOutcome::cancelled(none_if_empty(&last_text)));
            }

            // Safe point: steering preempts this call and the rest of the
            // batch.
            if steering.has_pending_steer() {
                if let Err(e) = skip_remaining(state, bus, &session_id, &calls[idx..]) {
                    return fail_round(bus, round, e);
                }
                let text = steering.take_steer().unwrap_or_default();
                pending_user = Some(Message::user(text).with_source(Source::Steer));
                bus.emit(AgentEvent::TurnEnd {
                    round,
                    status: TurnStatus::Steered,
                    tool_calls_count: Some(calls.len()),
                    assistant_message_preview: Some(preview(&assistant_text)),
                    tool_results_preview: None,
                });
                steered = true;
                break;
            }

            bus.emit(AgentEvent::ToolExecutionStart {
                call_id: call.id.clone(),
                name: call.name.clone(),
                skipped: false,
            });

            let progress_bus = bus.clone();
            let progress_call_id = call.id.clone();
            let ctx = ToolContext {
                session_id: session_id.clone(),
                workspace_dir: state.config.workspace_dir.clone(),
                depth: params.depth,
                cancel: cancel.clone(),
                on_progress: Arc::new(move |text: &str| {
                    progress_bus.emit(AgentEvent::ToolExecutionUpdate {
                        call_id: progress_call_id.clone(),
                        text: text.to_owned(),
                    });
                }),
            };
            let outcome = tools::dispatch_tool(state, &call.name, &call.arguments, &ctx).await;

            bus.emit(AgentEvent::ToolExecutionEnd {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result_preview: preview(&outcome.text),
                is_error: outcome.is_error,
                skipped: false,
                details: outcome.details,
            });

            result_previews.push(preview(&outcome.text));
            let tool_msg = Message::tool_result(&call.id, &call.name, outcome.text);
            if let Err(e) = state.store.append(&session_id, tool_msg) {
                return fail_round(bus, round, e);
            }
        }
        if steered {
            continue;
        }

        bus.emit(AgentEvent::TurnEnd {
            round,
            status: TurnStatus::ToolCallsProcessed,
            tool_calls_count: Some(calls.len()),
            assistant_message_preview: Some(preview(&assistant_text)),
            tool_results_preview: Some(result_previews.join(" | ")),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Record skipped results for the given calls: paired events plus synthetic
/// tool messages, so every call id stays answered.
fn skip_remaining(
    state: &Arc<RuntimeState>,
    bus: &Arc<EventBus>,
    session_id: &str,
    calls: &[ToolCall],
) -> Result<()> {
    for call in calls {
        bus.emit(AgentEvent::ToolExecutionStart {
            call_id: call.id.clone(),
            name: call.name.clone(),
            skipped: true,
        });
        let msg = Message::tool_result(&call.id, &call.name, SKIPPED_TOOL_RESULT)
            .with_source(Source::Skipped);
        state.store.append(session_id, msg)?;
        bus.emit(AgentEvent::ToolExecutionEnd {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result_preview: SKIPPED_TOOL_RESULT.to_owned(),
            is_error: false,
            skipped: true,
            details: None,
        });
    }
    Ok(())
}

fn emit_turn_end(bus: &Arc<EventBus>, round: u32, status: TurnStatus) {
    bus.emit(AgentEvent::TurnEnd {
        round,
        status,
        tool_calls_count: None,
        assistant_message_preview: None,
        tool_results_preview: None,
    });
}

/// Close the round as failed and propagate the error.
fn fail_round(bus: &Arc<EventBus>, round: u32, error: Error) -> Result<RunOutcome> {
    emit_turn_end(bus, round, TurnStatus::Failed);
    Err(error)
}

fn none_if_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

/// Hash of the round's observable behavior: assistant text plus the ordered
/// `(name, canonical args)` tuple of its tool calls.
fn round_signature(assistant_text: &str, calls: &[ToolCall]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(assistant_text.as_bytes());
    for call in calls {
        hasher.update([0u8]);
        hasher.update(call.name.as_bytes());
        hasher.update([0u8]);
        // serde_json orders object keys, so this is canonical.
        hasher.update(call.arguments.to_string().as_bytes());
    }
    hasher.finalize().into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider call with retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ProviderCall {
    Ok(Completion),
    Cancelled,
    Failed(ProviderError),
}

/// Call the provider, retrying transient failures with exponential backoff.
/// Both the in-flight call and the backoff sleeps race the cancel token.
async fn call_provider(
    state: &Arc<RuntimeState>,
    bus: &Arc<EventBus>,
    messages: Vec<Message>,
    tools: Vec<spindle_domain::ToolDefinition>,
    cancel: &CancelToken,
) -> ProviderCall {
    let api_key = state.hooks.get_api_key.as_ref().and_then(|hook| hook());
    let request = CompletionRequest {
        messages,
        tools,
        model: state.config.model.clone(),
        api_key,
    };

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return ProviderCall::Cancelled;
        }

        let stream_sink: Option<TextDeltaSink> = if state.config.stream {
            let bus = bus.clone();
            let user_delta = state.on_text_delta.clone();
            Some(Arc::new(move |delta: &str| {
                bus.emit(AgentEvent::MessageUpdate {
                    delta: delta.to_owned(),
                });
                if let Some(cb) = &user_delta {
                    cb(delta);
                }
            }))
        } else {
            None
        };

        // Provider I/O is a suspension point: a cancel fired mid-call
        // aborts the wait instead of being noticed a round later.
        let result = tokio::select! {
            result = state.provider.complete(request.clone(), stream_sink) => result,
            _ = cancel.cancelled() => return ProviderCall::Cancelled,
        };

        match result {
            Ok(completion) => return ProviderCall::Ok(completion),
            Err(e) if e.is_transient() && attempt < state.config.max_retries => {
                let delay = Duration::from_secs_f64(
                    state.config.retry_base_seconds.max(0.0) * f64::powi(2.0, attempt as i32),
                );
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return ProviderCall::Cancelled,
                }
                attempt += 1;
            }
            Err(e) => return ProviderCall::Failed(e),
        }
    }
}
