// ============================================
// BRIDGE HTTP SERVER
// Router, shared state, and lifecycle
// ============================================

pub mod auth;

use crate::bridge;
use crate::config::BridgeConfig;
use crate::dify::{DifyClient, WorkflowInvocation};
use crate::error::{AppError, AppResult};
use crate::form::LoanApplicationForm;
use crate::upload::{upload_handler, UploadPolicy};
use auth::AuthMode;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the bridge router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub http: reqwest::Client,
    pub policy: UploadPolicy,
    pub auth: AuthMode,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> AppResult<Self> {
        // No overall timeout: workflow streams stay open for minutes.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            policy: UploadPolicy::with_max_bytes(config.upload_max_bytes),
            auth: AuthMode::from_config(&config),
            config: Arc::new(config),
            http,
            started_at: Instant::now(),
        })
    }

    /// Fails with a configuration error when credentials are missing.
    pub fn dify_client(&self) -> AppResult<DifyClient> {
        let credentials = self.config.provider_credentials()?;
        Ok(DifyClient::new(self.http.clone(), credentials, &self.config.service_user))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowRequestBody {
    form_data: LoanApplicationForm,
    #[serde(default)]
    file_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct HostInfo {
    hostname: String,
    platform: String,
    os_family: String,
    arch: String,
}

impl HostInfo {
    fn current() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            os_family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/workflow", post(workflow_handler))
        .route("/upload", post(upload_handler).layer(DefaultBodyLimit::disable()))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_session));

    Router::new()
        .merge(protected)
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let mut body = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "host": HostInfo::current(),
    });
    // Provider probe only when credentials are configured.
    if let Ok(client) = state.dify_client() {
        let dify = if client.is_reachable().await { "connected" } else { "disconnected" };
        body["externalServices"] = serde_json::json!({ "dify": dify });
    }
    body["responseTime"] = serde_json::json!(started.elapsed().as_millis() as u64);
    Json(body)
}

async fn workflow_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let client = state.dify_client()?;
    let request: WorkflowRequestBody = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation(format!("Invalid form data: {e}")))?;
    let file_ids = request.file_ids.unwrap_or_default();
    if file_ids.is_empty() {
        tracing::warn!("[workflow] no file ids provided, proceeding without files");
    }

    let invocation = WorkflowInvocation::new(&request.form_data, &file_ids, client.user());
    tracing::info!(
        company = %invocation.inputs().company_name,
        files = invocation.files().len(),
        "[workflow] invoking provider"
    );
    Ok(bridge::into_sse(bridge::spawn(client, invocation)))
}

/// A running server. Dropping it does not stop the server; call [`shutdown`](Self::shutdown).
pub struct RunningServer {
    pub local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

pub async fn start_server(state: AppState, addr: SocketAddr) -> AppResult<RunningServer> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind bridge server on {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| AppError::Internal(format!("Failed to read bound address: {e}")))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tracing::info!("[server] listening on http://{local_addr}");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("[server] shutting down");
            })
            .await
        {
            tracing::error!("[server] server error: {e}");
        }
    });

    Ok(RunningServer { local_addr, shutdown_tx, handle })
}
