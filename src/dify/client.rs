use super::types::{DifyFileUploadResponse, UploadError, WorkflowInvocation};
use crate::config::ProviderCredentials;
use crate::error::{AppError, AppResult};
use bytes::Bytes;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Bearer-authenticated client for the provider's HTTP API.
#[derive(Clone)]
pub struct DifyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    user: String,
}

/// Error body the provider returns on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl DifyClient {
    pub fn new(http: reqwest::Client, credentials: ProviderCredentials, user: &str) -> Self {
        Self {
            http,
            base_url: credentials.base_url,
            api_key: credentials.api_key,
            user: user.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Start a streaming workflow run. The returned response body is the event stream.
    pub async fn run_workflow(&self, invocation: &WorkflowInvocation) -> AppResult<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint("/workflows/run"))
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(invocation)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamTransport {
                status: Some(status.as_u16()),
                message: format!("Provider returned {}: {}", status.as_u16(), truncate(&body)),
            });
        }
        Ok(response)
    }

    /// Forward one file to `/files/upload`. Errors come back already normalized.
    pub async fn upload_file(
        &self,
        file_name: &str,
        data: Bytes,
        mime_type: &str,
        timeout: Duration,
    ) -> Result<DifyFileUploadResponse, UploadError> {
        let part = Part::bytes(data.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| UploadError::new("UNKNOWN_ERROR", format!("Invalid MIME type: {e}"), 500))?;
        let form = Form::new().part("file", part).text("user", self.user.clone());

        let response = self
            .http
            .post(self.endpoint("/files/upload"))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(network_error)?;

        if status.is_success() {
            return serde_json::from_slice::<DifyFileUploadResponse>(&body).map_err(|e| {
                UploadError::new("UNKNOWN_ERROR", format!("Unexpected upload response: {e}"), 500)
            });
        }

        let parsed: ProviderErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        Err(UploadError::new(
            parsed.code.as_deref().unwrap_or("DIFY_API_ERROR"),
            parsed
                .message
                .unwrap_or_else(|| format!("Provider API error ({})", status.as_u16())),
            status.as_u16(),
        ))
    }

    /// Probe `/info`. Used by the health endpoint only.
    pub async fn is_reachable(&self) -> bool {
        match self
            .http
            .get(self.endpoint("/info"))
            .bearer_auth(&self.api_key)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn network_error(e: reqwest::Error) -> UploadError {
    if e.is_timeout() {
        UploadError::new("UPLOAD_ERROR", "Upload to provider timed out", 504)
    } else {
        UploadError::new("UPLOAD_ERROR", format!("Upload to provider failed: {e}"), 502)
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        let cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{cut}...")
    } else {
        body.to_string()
    }
}
