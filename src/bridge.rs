// ============================================
// STREAMING BRIDGE
// Provider workflow stream → downstream server-sent events
// ============================================

use crate::dify::{DifyClient, ProviderEvent, WorkflowInvocation};
use crate::error::AppError;
use crate::stream::{reframe, Flow, Outbound, ProviderStreamParser, UpstreamItem};
use crate::stream::translate::timestamp;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Downstream frames buffered between the pump task and the HTTP response.
const CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const STARTED_MESSAGE: &str = "Workflow started";
pub const COMPLETED_MESSAGE: &str = "Workflow completed";
pub const FAILED_MESSAGE: &str = "Workflow execution failed";
pub const BRIDGE_ERROR_CODE: &str = "WORKFLOW_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Started => "started",
            Phase::Streaming => "streaming",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How the upstream read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// `[DONE]` received.
    Done,
    /// Provider sent an `error` event.
    ProviderError,
    /// Upstream closed without `[DONE]`.
    Eof,
    /// Downstream consumer went away.
    Disconnected,
}

/// One bridge invocation. Owns the phase and the run id used in every log line.
struct BridgeRun {
    id: Uuid,
    phase: Phase,
    tx: mpsc::Sender<Outbound>,
}

impl BridgeRun {
    fn enter(&mut self, next: Phase) {
        tracing::info!(run_id = %self.id, from = %self.phase, to = %next, "[bridge] phase");
        self.phase = next;
    }

    /// `false` once the receiver is gone.
    async fn emit(&self, frame: Outbound) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

fn synthetic(name: &str, message: &str) -> Outbound {
    Outbound {
        name: name.to_string(),
        payload: json!({ "message": message, "timestamp": timestamp() }),
        flow: Flow::Continue,
    }
}

fn error_frame(err: &AppError) -> Outbound {
    Outbound {
        name: "error".to_string(),
        payload: json!({
            "code": BRIDGE_ERROR_CODE,
            "message": FAILED_MESSAGE,
            "details": err.to_string(),
        }),
        flow: Flow::Stop,
    }
}

/// Start one invocation and return the receiving end of its downstream stream.
///
/// The first frame is always the synthetic `workflow_started`, sent before the
/// provider is contacted. The upstream body is owned by the spawned task and
/// dropped on every exit path.
pub fn spawn(client: DifyClient, invocation: WorkflowInvocation) -> mpsc::Receiver<Outbound> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut run = BridgeRun { id: Uuid::new_v4(), phase: Phase::Idle, tx };

    tokio::spawn(async move {
        tracing::info!(
            run_id = %run.id,
            files = invocation.files().len(),
            "[bridge] workflow requested"
        );
        run.enter(Phase::Started);
        if !run.emit(synthetic("workflow_started", STARTED_MESSAGE)).await {
            tracing::debug!(run_id = %run.id, "[bridge] client left before start");
            return;
        }

        match pump(&mut run, &client, &invocation).await {
            Ok(ending) => {
                tracing::info!(run_id = %run.id, ?ending, "[bridge] upstream finished");
                match ending {
                    Ending::ProviderError => run.enter(Phase::Failed),
                    _ => run.enter(Phase::Completed),
                }
            }
            Err(err) => {
                tracing::error!(run_id = %run.id, "[bridge] workflow failed: {err}");
                run.enter(Phase::Failed);
                let _ = run.emit(error_frame(&err)).await;
            }
        }
    });

    rx
}

async fn pump(
    run: &mut BridgeRun,
    client: &DifyClient,
    invocation: &WorkflowInvocation,
) -> Result<Ending, AppError> {
    let response = client.run_workflow(invocation).await?;
    run.enter(Phase::Streaming);

    let mut body = Box::pin(response.bytes_stream());
    let mut parser = ProviderStreamParser::new();

    loop {
        let next = tokio::select! {
            _ = run.tx.closed() => return Ok(Ending::Disconnected),
            next = body.next() => next,
        };
        let items = match next {
            Some(Ok(chunk)) => parser.feed(&chunk),
            Some(Err(e)) => return Err(AppError::transport(format!("Upstream read failed: {e}"))),
            None => {
                let tail = parser.finish();
                return Ok(forward(run, tail).await.unwrap_or(Ending::Eof));
            }
        };
        if let Some(ending) = forward(run, items).await {
            return Ok(ending);
        }
    }
}

/// Emit decoded items. Returns `Some` when reading must stop.
async fn forward(run: &BridgeRun, items: Vec<UpstreamItem>) -> Option<Ending> {
    for item in items {
        let frame = match item {
            UpstreamItem::Done => {
                let _ = run.emit(synthetic("workflow_completed", COMPLETED_MESSAGE)).await;
                return Some(Ending::Done);
            }
            UpstreamItem::Event(decoded) => {
                if let ProviderEvent::Error { .. } = decoded.event {
                    let reported = AppError::ProviderReported(
                        decoded.event.error_message().unwrap_or("no message").to_string(),
                    );
                    tracing::warn!(run_id = %run.id, code = ?decoded.event.error_code(), "[bridge] {reported}");
                }
                reframe(&decoded)
            }
        };
        tracing::debug!(run_id = %run.id, event = %frame.name, "[bridge] forward");
        let stop = frame.flow == Flow::Stop;
        if !run.emit(frame).await {
            return Some(Ending::Disconnected);
        }
        if stop {
            return Some(Ending::ProviderError);
        }
    }
    None
}

impl Outbound {
    pub fn into_event(self) -> Event {
        Event::default().event(self.name).data(self.payload.to_string())
    }
}

/// Wrap a bridge receiver as an SSE response with periodic keep-alive comments.
pub fn into_sse(
    rx: mpsc::Receiver<Outbound>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(rx).map(|frame| Ok(frame.into_event()));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
