// ============================================
// WORKFLOW EXECUTOR
// Consumes the bridge's event stream and maintains ExecutionState
// ============================================

use super::identity::IdentityProvider;
use super::state::*;
use crate::dify::ProviderEvent;
use crate::error::{AppError, AppResult};
use crate::form::LoanApplicationForm;
use crate::stream::{apply, Frame, LineFramer};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const CANCEL_POLL: Duration = Duration::from_millis(50);

pub type ProgressCallback = Arc<dyn Fn(&ExecutionState) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
pub struct ExecutionOptions {
    pub timeout: Duration,
    pub on_progress: Option<ProgressCallback>,
    pub on_event: Option<EventCallback>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, on_progress: None, on_event: None }
    }
}

impl ExecutionOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&ExecutionState) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }
}

/// Drives one workflow execution at a time against the bridge.
///
/// State is published on a watch channel; [`subscribe`](Self::subscribe) to
/// observe it. Only this type writes to it.
pub struct WorkflowExecutor {
    http: reqwest::Client,
    base_url: String,
    identity: Option<Arc<dyn IdentityProvider>>,
    state: watch::Sender<ExecutionState>,
    event_log: Mutex<Vec<Value>>,
    cancel_token: Mutex<Option<Arc<AtomicBool>>>,
}

impl WorkflowExecutor {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        let (state, _) = watch::channel(ExecutionState::default());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity: None,
            state,
            event_log: Mutex::new(Vec::new()),
            cancel_token: Mutex::new(None),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ExecutionState {
        self.state.borrow().clone()
    }

    /// Provider events in arrival order, including ones after a terminal state.
    pub fn event_log(&self) -> Vec<Value> {
        self.event_log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn progress_percentage(&self) -> f64 {
        self.state.borrow().progress_percentage()
    }

    pub fn is_executing(&self) -> bool {
        self.state.borrow().status == ExecutionStatus::Processing
    }

    pub fn is_completed(&self) -> bool {
        self.state.borrow().status == ExecutionStatus::Completed
    }

    pub fn has_error(&self) -> bool {
        self.state.borrow().status == ExecutionStatus::Error
    }

    pub fn reset(&self) {
        self.state.send_replace(ExecutionState::default());
        self.event_log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Mark the current execution cancelled and drop its connection.
    ///
    /// Only the client side stops; the bridge and provider may keep running.
    pub fn cancel(&self) {
        let cancelled = self.state.send_if_modified(|s| {
            if s.status == ExecutionStatus::Processing {
                *s = s.failed(LABEL_CANCELLED, CANCELLED_MESSAGE);
                true
            } else {
                false
            }
        });
        if cancelled {
            tracing::info!("[executor] cancelled by user");
            if let Some(token) = self.cancel_token.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                token.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Run one workflow and return the final state.
    ///
    /// Finishes on `workflow_completed`, on a bridge `error` frame, or when
    /// the stream ends after a terminal state. Otherwise the timeout decides.
    pub async fn execute(
        &self,
        form: &LoanApplicationForm,
        file_ids: &[String],
        options: ExecutionOptions,
    ) -> ExecutionState {
        self.reset();
        // Token first: a cancel() that sees Processing must find it.
        let token = Arc::new(AtomicBool::new(false));
        *self.cancel_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        self.state.send_replace(ExecutionState::starting());

        let outcome = tokio::select! {
            result = tokio::time::timeout(options.timeout, self.run(form, file_ids, &options)) => result,
            _ = cancelled(&token) => Ok(Ok(())),
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!("[executor] execution failed: {err}");
                let label = match &err {
                    AppError::UpstreamProtocol(_) => LABEL_STREAM_ERROR,
                    _ => LABEL_EXECUTION_ERROR,
                };
                self.fail(label, err.to_string(), &options);
            }
            Err(_) => {
                tracing::warn!(timeout_secs = options.timeout.as_secs_f64(), "[executor] timed out");
                self.fail(LABEL_TIMED_OUT, TIMEOUT_MESSAGE, &options);
            }
        }

        *self.cancel_token.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.state()
    }

    async fn run(
        &self,
        form: &LoanApplicationForm,
        file_ids: &[String],
        options: &ExecutionOptions,
    ) -> AppResult<()> {
        let mut request = self
            .http
            .post(format!("{}/workflow", self.base_url))
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "formData": form, "fileIds": file_ids }));
        if let Some(token) = self.identity.as_ref().and_then(|i| i.access_token()) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamTransport {
                status: Some(status.as_u16()),
                message: format!("Bridge returned HTTP {}", status.as_u16()),
            });
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut framer = LineFramer::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| AppError::UpstreamProtocol(format!("Event stream read failed: {e}")))?;
            for frame in framer.feed(&chunk) {
                if self.handle_frame(frame, options) {
                    return Ok(());
                }
            }
        }
        for frame in framer.finish() {
            if self.handle_frame(frame, options) {
                return Ok(());
            }
        }
        drop(body);

        if self.state.borrow().status.is_terminal() {
            return Ok(());
        }
        // Stream ended without a verdict. Only the deadline can end this run now.
        tracing::warn!("[executor] event stream ended before the workflow finished");
        std::future::pending::<()>().await;
        Ok(())
    }

    /// Returns `true` when the frame completes the execution.
    fn handle_frame(&self, frame: Frame, options: &ExecutionOptions) -> bool {
        let payload: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[executor] skipping unreadable frame: {e}");
                return false;
            }
        };

        if let Some(dify) = payload.get("difyEvent") {
            self.event_log.lock().unwrap_or_else(|e| e.into_inner()).push(dify.clone());
            if let Some(on_event) = &options.on_event {
                on_event(dify);
            }
            match ProviderEvent::deserialize(dify) {
                Ok(event) => {
                    self.state.send_if_modified(|s| match apply(s, &event) {
                        Some(next) => {
                            *s = next;
                            true
                        }
                        None => false,
                    });
                }
                Err(e) => tracing::warn!("[executor] unrecognised provider event: {e}"),
            }
            self.notify_progress(options);
            return false;
        }

        match frame.event.as_deref() {
            Some("workflow_completed") => true,
            Some("error") => {
                let message = ["details", "message"]
                    .iter()
                    .find_map(|k| payload.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
                    .unwrap_or("Workflow execution failed")
                    .to_string();
                self.fail(LABEL_STREAM_ERROR, message, options);
                true
            }
            _ => false,
        }
    }

    fn fail(&self, label: &str, message: impl Into<String>, options: &ExecutionOptions) {
        let message = message.into();
        let changed = self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            *s = s.failed(label, message);
            true
        });
        if changed {
            self.notify_progress(options);
        }
    }

    fn notify_progress(&self, options: &ExecutionOptions) {
        if let Some(on_progress) = &options.on_progress {
            let snapshot = self.state();
            on_progress(&snapshot);
        }
    }
}

async fn cancelled(token: &AtomicBool) {
    while !token.load(Ordering::Relaxed) {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::identity::{StaticTokenProvider, UserProfile};
    use crate::config::BridgeConfig;
    use crate::test_support::{config_for, spawn_bridge, spawn_fake_provider, FakeProvider};

    fn data(line: &str) -> String {
        format!("data: {line}\n\n")
    }

    fn form() -> LoanApplicationForm {
        LoanApplicationForm { company_name: Some("Acme".into()), ..Default::default() }
    }

    #[tokio::test]
    async fn test_success_scenario() {
        let fake = spawn_fake_provider(FakeProvider::stream(vec![
            data(r#"{"event":"workflow_started","task_id":"t1","workflow_run_id":"r1","data":{}}"#),
            data(r#"{"event":"node_started","data":{"title":"Extract","index":0}}"#),
            data(r#"{"event":"node_finished","data":{"title":"Extract","index":0}}"#),
            data(r#"{"event":"node_started","data":{"title":"Score","index":1}}"#),
            data(r#"{"event":"node_finished","data":{"title":"Score","index":1}}"#),
            data(r#"{"event":"workflow_finished","data":{"status":"succeeded","outputs":{"x":1},"total_tokens":42}}"#),
            data("[DONE]"),
        ]))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let executor = WorkflowExecutor::new(&base);
        let options = ExecutionOptions::default()
            .on_progress(move |s| recorder.lock().unwrap().push(s.progress));

        let state = executor.execute(&form(), &["f-1".to_string()], options).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.progress, 100.0);
        assert_eq!(state.result, Some(json!({"x": 1})));
        assert_eq!(state.total_tokens, Some(42));
        assert_eq!(state.workflow_run_id.as_deref(), Some("r1"));
        assert!(executor.is_completed());
        assert_eq!(executor.event_log().len(), 6);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_provider_error_scenario() {
        let fake = spawn_fake_provider(FakeProvider::stalling(
            vec![
                data(r#"{"event":"workflow_started","data":{}}"#),
                data(r#"{"event":"error","data":{"code":"E1","message":"boom"}}"#),
                data(r#"{"event":"node_started","data":{"title":"late","index":0}}"#),
            ],
            2,
            Duration::from_secs(30),
        ))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = WorkflowExecutor::new(&base);
        let options = ExecutionOptions::default().timeout(Duration::from_secs(10));
        let state = tokio::time::timeout(Duration::from_secs(5), executor.execute(&form(), &[], options))
            .await
            .expect("execution should end on the error event");
        assert_eq!(state.status, ExecutionStatus::Error);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(state.progress, 0.0);
        assert!(executor.event_log().iter().all(|e| e["event"] != "node_started"));
    }

    #[tokio::test]
    async fn test_dropped_stream_times_out() {
        let fake = spawn_fake_provider(FakeProvider::stream(vec![data(
            r#"{"event":"workflow_started","data":{}}"#,
        )]))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = WorkflowExecutor::new(&base);
        let options = ExecutionOptions::default().timeout(Duration::from_millis(500));
        let state = executor.execute(&form(), &[], options).await;
        assert_eq!(state.status, ExecutionStatus::Error);
        assert_eq!(state.error.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(state.current_step, LABEL_TIMED_OUT);
        assert_eq!(state.progress, 0.0);
    }

    #[tokio::test]
    async fn test_events_after_terminal_are_logged_only() {
        let fake = spawn_fake_provider(FakeProvider::stream(vec![
            data(r#"{"event":"workflow_finished","data":{"status":"succeeded","outputs":{"ok":true}}}"#),
            data(r#"{"event":"node_started","data":{"title":"late","index":3}}"#),
            data("[DONE]"),
        ]))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = WorkflowExecutor::new(&base);
        let state = executor.execute(&form(), &[], ExecutionOptions::default()).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.current_step, "Workflow complete");
        assert_eq!(executor.event_log().len(), 2);
    }

    #[tokio::test]
    async fn test_bridge_error_frame_completes() {
        let fake = spawn_fake_provider(FakeProvider::status(401, r#"{"code":"unauthorized"}"#)).await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = WorkflowExecutor::new(&base);
        let state = executor.execute(&form(), &[], ExecutionOptions::default()).await;
        assert_eq!(state.status, ExecutionStatus::Error);
        assert_eq!(state.current_step, LABEL_STREAM_ERROR);
        assert!(state.error.unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_unconfigured_bridge_is_execution_error() {
        let base = spawn_bridge(BridgeConfig::default()).await;
        let executor = WorkflowExecutor::new(&base);
        let state = executor.execute(&form(), &[], ExecutionOptions::default()).await;
        assert_eq!(state.status, ExecutionStatus::Error);
        assert_eq!(state.current_step, LABEL_EXECUTION_ERROR);
        assert!(executor.has_error());
    }

    #[tokio::test]
    async fn test_cancel_while_processing() {
        let fake = spawn_fake_provider(FakeProvider::hanging(&data(
            r#"{"event":"workflow_started","data":{}}"#,
        )))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = Arc::new(WorkflowExecutor::new(&base));
        let mut updates = executor.subscribe();
        let runner = executor.clone();
        let task = tokio::spawn(async move { runner.execute(&form(), &[], ExecutionOptions::default()).await });

        updates.wait_for(|s| s.progress >= 5.0).await.unwrap();
        assert!(executor.is_executing());
        executor.cancel();

        let state = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Error);
        assert_eq!(state.error.as_deref(), Some(CANCELLED_MESSAGE));

        // Not processing any more: a second cancel changes nothing.
        executor.cancel();
        assert_eq!(executor.state().current_step, LABEL_CANCELLED);
    }

    #[tokio::test]
    async fn test_cancel_as_soon_as_processing() {
        let fake = spawn_fake_provider(FakeProvider::hanging(&data(
            r#"{"event":"workflow_started","data":{}}"#,
        )))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;

        let executor = Arc::new(WorkflowExecutor::new(&base));
        let mut updates = executor.subscribe();
        let runner = executor.clone();
        let task = tokio::spawn(async move { runner.execute(&form(), &[], ExecutionOptions::default()).await });

        // Cancel on the very first Processing publish, before any event arrives.
        updates
            .wait_for(|s| s.status == ExecutionStatus::Processing)
            .await
            .unwrap();
        executor.cancel();

        let state = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel did not release the running request")
            .unwrap();
        assert_eq!(state.error.as_deref(), Some(CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn test_session_token_attached() {
        let fake = spawn_fake_provider(FakeProvider::stream(vec![
            data(r#"{"event":"workflow_finished","data":{"status":"succeeded","outputs":{}}}"#),
            data("[DONE]"),
        ]))
        .await;
        let config = BridgeConfig { session_token: Some("sess".into()), ..config_for(&fake) };
        let base = spawn_bridge(config).await;

        let anonymous = WorkflowExecutor::new(&base);
        let state = anonymous.execute(&form(), &[], ExecutionOptions::default()).await;
        assert!(state.error.unwrap().contains("401"));

        let identity = Arc::new(StaticTokenProvider::new("sess", UserProfile { sub: None, email: None, name: None }));
        identity.login().await.unwrap();
        let executor = WorkflowExecutor::new(&base).with_identity(identity);
        let state = executor.execute(&form(), &[], ExecutionOptions::default()).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_reset_and_predicates() {
        let executor = WorkflowExecutor::new("http://127.0.0.1:9");
        assert!(!executor.is_executing());
        assert_eq!(executor.progress_percentage(), 0.0);
        executor.cancel();
        assert_eq!(executor.state().status, ExecutionStatus::Idle);
        executor.reset();
        assert_eq!(executor.state(), ExecutionState::default());
    }
}
