// ============================================
// UPLOAD GATEWAY
// File validation shared with the client, and the `/upload` handler
// ============================================

use crate::dify::{FileUploadResult, UploadError};
use crate::server::AppState;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;

pub const ALLOWED_EXTENSIONS: [&str; 7] = [".pdf", ".doc", ".docx", ".xls", ".xlsx", ".txt", ".csv"];

/// Size ceiling and extension allow-list applied before any outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::with_max_bytes(crate::config::DEFAULT_UPLOAD_MAX_BYTES)
    }
}

impl UploadPolicy {
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            allowed_extensions: ALLOWED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Lower-cased extension including the dot, e.g. `.pdf`.
pub fn extension_of(file_name: &str) -> Option<String> {
    file_name.rfind('.').map(|i| file_name[i..].to_lowercase())
}

pub fn mime_type_for(extension: &str) -> &'static str {
    match extension {
        ".pdf" => "application/pdf",
        ".doc" => "application/msword",
        ".docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".xls" => "application/vnd.ms-excel",
        ".xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".txt" => "text/plain",
        ".csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Size is checked before the extension.
pub fn validate_file(file_name: &str, size: u64, policy: &UploadPolicy) -> Result<(), UploadError> {
    if size > policy.max_bytes {
        let mib = (policy.max_bytes as f64 / (1024.0 * 1024.0)).round();
        return Err(UploadError::new(
            "VALIDATION_ERROR",
            format!("File is too large (max {mib} MB)"),
            StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
        ));
    }
    let allowed = extension_of(file_name)
        .map(|ext| policy.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
        .unwrap_or(false);
    if !allowed {
        return Err(UploadError::new(
            "VALIDATION_ERROR",
            format!(
                "File type is not allowed. Supported: {}",
                policy.allowed_extensions.join(", ")
            ),
            StatusCode::BAD_REQUEST.as_u16(),
        ));
    }
    Ok(())
}

fn bad_request(message: &str) -> UploadError {
    UploadError::new("VALIDATION_ERROR", message, StatusCode::BAD_REQUEST.as_u16())
}

/// Read the first field that carries a file name, stopping one byte past the
/// ceiling so oversized bodies are never buffered in full.
async fn read_file(multipart: &mut Multipart, policy: &UploadPolicy) -> Result<(String, Bytes), UploadError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(&format!("Invalid multipart body: {e}")))?;
        let Some(mut field) = field else {
            return Err(bad_request("No file attached"));
        };
        let Some(file_name) = field.file_name().filter(|n| !n.is_empty()).map(str::to_string) else {
            continue;
        };

        let mut data = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| bad_request(&format!("Invalid multipart body: {e}")))?
        {
            data.extend_from_slice(&chunk);
            if data.len() as u64 > policy.max_bytes {
                break;
            }
        }
        validate_file(&file_name, data.len() as u64, policy)?;
        return Ok((file_name, Bytes::from(data)));
    }
}

fn respond(result: FileUploadResult) -> Response {
    let status = match &result {
        FileUploadResult::Success(_) => StatusCode::OK,
        FileUploadResult::Failure(err) => {
            StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    (status, Json(result)).into_response()
}

pub async fn upload_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let client = match state.dify_client() {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("[upload] {err}");
            let status = err.status().as_u16();
            return respond(FileUploadResult::Failure(UploadError::new(err.code(), err.to_string(), status)));
        }
    };

    let (file_name, data) = match read_file(&mut multipart, &state.policy).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(code = %err.code, "[upload] rejected: {}", err.message);
            return respond(FileUploadResult::Failure(err));
        }
    };

    let extension = extension_of(&file_name).unwrap_or_default();
    let size = data.len();
    tracing::info!(file = %file_name, size, "[upload] forwarding");

    match client
        .upload_file(&file_name, data, mime_type_for(&extension), state.config.upload_timeout())
        .await
    {
        Ok(uploaded) => {
            tracing::info!(file = %file_name, file_id = %uploaded.id, "[upload] stored");
            respond(FileUploadResult::Success(uploaded))
        }
        Err(err) => {
            tracing::warn!(file = %file_name, code = %err.code, status = err.status, "[upload] failed: {}", err.message);
            respond(FileUploadResult::Failure(err))
        }
    }
}
