//! Provider event → downstream frame, and provider event → client state.
//!
//! The bridge uses [`reframe`] to decide what to emit and whether to keep
//! reading. The client executor uses [`apply`] on the same events once they
//! come back out of the downstream stream.

use crate::client::state::{ExecutionState, ExecutionStatus};
use crate::dify::{DecodedEvent, ProviderEvent, RunStatus};
use serde_json::{json, Value};

pub const LABEL_STARTED: &str = "Workflow started";
pub const LABEL_COMPLETE: &str = "Workflow complete";
pub const LABEL_FAILED: &str = "Workflow failed";
pub const LABEL_ERROR: &str = "Error occurred";

const FALLBACK_FAILED: &str = "Workflow failed";
const FALLBACK_ERROR: &str = "Workflow error occurred";

/// Whether the bridge keeps reading upstream after emitting a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One downstream event: SSE event name plus JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub name: String,
    pub payload: Value,
    pub flow: Flow,
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Re-frame one provider event for the downstream stream.
///
/// The payload carries the provider's JSON untouched under `difyEvent`.
/// `text_chunk` additionally lifts its text to the top level. `error` is
/// forwarded and then stops the read loop.
pub fn reframe(decoded: &DecodedEvent) -> Outbound {
    let mut payload = json!({
        "difyEvent": decoded.raw,
        "timestamp": timestamp(),
    });
    if let ProviderEvent::TextChunk { data, .. } = &decoded.event {
        payload["text"] = Value::String(data.text.clone());
    }
    let flow = match decoded.event {
        ProviderEvent::Error { .. } => Flow::Stop,
        _ => Flow::Continue,
    };
    Outbound {
        name: decoded.tag().to_string(),
        payload,
        flow,
    }
}

/// Next client state after `event`, or `None` when the event has no effect.
///
/// Progress only moves up while processing; error resets it to 0 and a
/// successful finish sets it to 100. Once the state is terminal nothing here
/// changes it.
pub fn apply(state: &ExecutionState, event: &ProviderEvent) -> Option<ExecutionState> {
    if state.status.is_terminal() {
        return None;
    }
    let mut next = state.clone();
    match event {
        ProviderEvent::WorkflowStarted { task_id, workflow_run_id, .. } => {
            next.status = ExecutionStatus::Processing;
            next.current_step = LABEL_STARTED.to_string();
            next.progress = ratchet(state.progress, 5.0);
            if !task_id.is_empty() {
                next.task_id = Some(task_id.clone());
            }
            if !workflow_run_id.is_empty() {
                next.workflow_run_id = Some(workflow_run_id.clone());
            }
        }
        ProviderEvent::NodeStarted { data, .. } => {
            next.current_step = format!("Running {}...", data.title);
            next.current_step_index = data.index;
            next.total_steps = state.total_steps.max(data.index + 1);
            next.progress = ratchet(state.progress, (10.0 + data.index as f64 * 8.0).min(90.0));
        }
        ProviderEvent::NodeFinished { data, .. } => {
            next.current_step = format!("{} complete", data.title);
            next.progress = ratchet(state.progress, (20.0 + data.index as f64 * 7.5).min(95.0));
        }
        ProviderEvent::WorkflowFinished { data, .. } => {
            if data.status == RunStatus::Succeeded {
                next.status = ExecutionStatus::Completed;
                next.progress = 100.0;
                next.current_step = LABEL_COMPLETE.to_string();
                next.result = data.outputs.clone();
                next.elapsed_time = data.elapsed_time;
                next.total_tokens = data.total_tokens;
            } else {
                let message = event.error_message().unwrap_or(FALLBACK_FAILED);
                next = state.failed(LABEL_FAILED, message);
            }
        }
        ProviderEvent::Error { .. } => {
            let message = event.error_message().unwrap_or(FALLBACK_ERROR);
            next = state.failed(LABEL_ERROR, message);
        }
        ProviderEvent::TextChunk { .. }
        | ProviderEvent::TtsMessage { .. }
        | ProviderEvent::TtsMessageEnd { .. }
        | ProviderEvent::Ping
        | ProviderEvent::Other => return None,
    }
    Some(next)
}

fn ratchet(current: f64, computed: f64) -> f64 {
    current.max(computed)
}
