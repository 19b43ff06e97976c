//! In-process fake provider and bridge servers for tests.

use crate::config::BridgeConfig;
use crate::server::{build_router, AppState};
use axum::body::{Body, Bytes};
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub enum WorkflowReply {
    /// Serve `chunks` in order, sleeping `stall` before chunk `stall_at`.
    Stream { chunks: Vec<String>, stall_at: Option<usize>, stall: Duration },
    Status { code: u16, body: String },
    /// Send `head`, then comment lines forever.
    Hanging { head: String },
    /// Send `head`, then fail the body so the connection is cut mid-stream.
    Abort { head: String },
}

#[derive(Clone, Debug)]
pub enum UploadReply {
    Ok,
    Status { code: u16, body: String },
    Slow(Duration),
}

#[derive(Clone, Debug)]
pub struct FakeProvider {
    pub workflow: WorkflowReply,
    pub upload: UploadReply,
    pub info_ok: bool,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            workflow: WorkflowReply::Stream { chunks: vec![], stall_at: None, stall: Duration::ZERO },
            upload: UploadReply::Ok,
            info_ok: true,
        }
    }
}

impl FakeProvider {
    pub fn stream(chunks: Vec<String>) -> Self {
        Self {
            workflow: WorkflowReply::Stream { chunks, stall_at: None, stall: Duration::ZERO },
            ..Self::default()
        }
    }

    pub fn stalling(chunks: Vec<String>, stall_at: usize, stall: Duration) -> Self {
        Self {
            workflow: WorkflowReply::Stream { chunks, stall_at: Some(stall_at), stall },
            ..Self::default()
        }
    }

    pub fn status(code: u16, body: &str) -> Self {
        Self {
            workflow: WorkflowReply::Status { code, body: body.to_string() },
            ..Self::default()
        }
    }

    pub fn hanging(head: &str) -> Self {
        Self {
            workflow: WorkflowReply::Hanging { head: head.to_string() },
            ..Self::default()
        }
    }

    pub fn aborting(head: &str) -> Self {
        Self {
            workflow: WorkflowReply::Abort { head: head.to_string() },
            ..Self::default()
        }
    }

    pub fn uploads(reply: UploadReply) -> Self {
        Self { upload: reply, ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadRecord {
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: usize,
    pub user: Option<String>,
}

#[derive(Default)]
pub struct Recorder {
    pub workflow_hits: AtomicUsize,
    pub upload_hits: AtomicUsize,
    pub info_hits: AtomicUsize,
    pub upstream_closed: AtomicBool,
    pub last_body: Mutex<Option<Value>>,
    pub last_auth: Mutex<Option<String>>,
    pub last_upload: Mutex<Option<UploadRecord>>,
}

struct FakeState {
    provider: FakeProvider,
    recorder: Arc<Recorder>,
}

pub struct FakeHandle {
    pub base_url: String,
    pub recorder: Arc<Recorder>,
}

impl FakeHandle {
    pub fn last_body(&self) -> Option<Value> {
        self.recorder.last_body.lock().unwrap().clone()
    }

    pub fn last_auth(&self) -> Option<String> {
        self.recorder.last_auth.lock().unwrap().clone()
    }

    pub fn last_upload(&self) -> Option<UploadRecord> {
        self.recorder.last_upload.lock().unwrap().clone()
    }

    pub fn upload_hits(&self) -> usize {
        self.recorder.upload_hits.load(Ordering::SeqCst)
    }

    pub fn workflow_hits(&self) -> usize {
        self.recorder.workflow_hits.load(Ordering::SeqCst)
    }

    pub fn upstream_closed(&self) -> bool {
        self.recorder.upstream_closed.load(Ordering::SeqCst)
    }
}

struct CloseGuard(Arc<Recorder>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.upstream_closed.store(true, Ordering::SeqCst);
    }
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

/// Start a fake provider. Its base URL already includes `/v1`.
pub async fn spawn_fake_provider(provider: FakeProvider) -> FakeHandle {
    let recorder = Arc::new(Recorder::default());
    let state = Arc::new(FakeState { provider, recorder: recorder.clone() });
    let router = Router::new()
        .route("/v1/workflows/run", post(fake_run))
        .route("/v1/files/upload", post(fake_upload))
        .route("/v1/info", get(fake_info))
        .with_state(state);
    let base = serve(router).await;
    FakeHandle { base_url: format!("{base}/v1"), recorder }
}

/// Start the real bridge router against `config`.
pub async fn spawn_bridge(config: BridgeConfig) -> String {
    serve(build_router(AppState::new(config).unwrap())).await
}

/// Bridge config pointing at a fake provider.
pub fn config_for(fake: &FakeHandle) -> BridgeConfig {
    BridgeConfig {
        dify_api_key: Some("test-key".into()),
        dify_api_base_url: fake.base_url.clone(),
        ..BridgeConfig::default()
    }
}

fn record_auth(recorder: &Recorder, headers: &HeaderMap) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *recorder.last_auth.lock().unwrap() = auth;
}

async fn fake_run(State(state): State<Arc<FakeState>>, headers: HeaderMap, body: Bytes) -> Response {
    let recorder = state.recorder.clone();
    recorder.workflow_hits.fetch_add(1, Ordering::SeqCst);
    record_auth(&recorder, &headers);
    *recorder.last_body.lock().unwrap() = serde_json::from_slice(&body).ok();

    match state.provider.workflow.clone() {
        WorkflowReply::Status { code, body } => {
            (StatusCode::from_u16(code).unwrap(), body).into_response()
        }
        WorkflowReply::Stream { chunks, stall_at, stall } => {
            let body = stream::iter(chunks.into_iter().enumerate()).then(move |(i, chunk)| async move {
                if stall_at == Some(i) {
                    tokio::time::sleep(stall).await;
                }
                Ok::<_, Infallible>(chunk)
            });
            event_stream(Body::from_stream(body))
        }
        WorkflowReply::Hanging { head } => {
            let guard = CloseGuard(recorder);
            let body = stream::unfold((guard, true), move |(guard, first)| {
                let head = head.clone();
                async move {
                    let chunk = if first {
                        head
                    } else {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ": keepalive\n\n".to_string()
                    };
                    Some((Ok::<_, Infallible>(chunk), (guard, false)))
                }
            });
            event_stream(Body::from_stream(body))
        }
        WorkflowReply::Abort { head } => {
            let body = stream::iter([Ok(head), Err(())]).then(|item| async move {
                match item {
                    Ok(chunk) => Ok(chunk),
                    Err(()) => {
                        // Let the head reach the wire before the body fails.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(std::io::Error::other("upstream aborted"))
                    }
                }
            });
            event_stream(Body::from_stream(body))
        }
    }
}

fn event_stream(body: Body) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

async fn fake_upload(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let recorder = state.recorder.clone();
    let hit = recorder.upload_hits.fetch_add(1, Ordering::SeqCst) + 1;
    record_auth(&recorder, &headers);

    let mut record = UploadRecord { file_name: String::new(), content_type: None, size: 0, user: None };
    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                record.file_name = field.file_name().unwrap_or_default().to_string();
                record.content_type = field.content_type().map(str::to_string);
                record.size = field.bytes().await.map(|b| b.len()).unwrap_or(0);
            }
            Some("user") => record.user = field.text().await.ok(),
            _ => {}
        }
    }
    *recorder.last_upload.lock().unwrap() = Some(record.clone());

    match state.provider.upload.clone() {
        UploadReply::Status { code, body } => {
            return (StatusCode::from_u16(code).unwrap(), body).into_response();
        }
        UploadReply::Slow(delay) => tokio::time::sleep(delay).await,
        UploadReply::Ok => {}
    }

    let extension = record.file_name.rsplit('.').next().unwrap_or_default().to_string();
    Json(json!({
        "id": format!("file-{hit}"),
        "name": record.file_name,
        "size": record.size,
        "extension": extension,
        "mime_type": record.content_type.unwrap_or_default(),
        "created_by": record.user.unwrap_or_default(),
        "created_at": 1_700_000_000,
    }))
    .into_response()
}

async fn fake_info(State(state): State<Arc<FakeState>>) -> Response {
    state.recorder.info_hits.fetch_add(1, Ordering::SeqCst);
    if state.provider.info_ok {
        Json(json!({"name": "loan-review"})).into_response()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}
