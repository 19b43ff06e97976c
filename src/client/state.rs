use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LABEL_IDLE: &str = "Idle";
pub const LABEL_STARTING: &str = "Starting workflow...";
pub const LABEL_TIMED_OUT: &str = "Timed out";
pub const LABEL_CANCELLED: &str = "Cancelled";
pub const LABEL_STREAM_ERROR: &str = "Stream error";
pub const LABEL_EXECUTION_ERROR: &str = "Execution error";

pub const TIMEOUT_MESSAGE: &str = "Workflow execution timed out";
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Uploading,
    Processing,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Error)
    }
}

/// Client-visible aggregate of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub progress: f64,
    pub current_step: String,
    pub total_steps: u32,
    pub current_step_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Idle,
            progress: 0.0,
            current_step: LABEL_IDLE.to_string(),
            total_steps: 0,
            current_step_index: 0,
            result: None,
            error: None,
            elapsed_time: None,
            total_tokens: None,
            task_id: None,
            workflow_run_id: None,
        }
    }
}

impl ExecutionState {
    /// State right after a request has been sent, before any event arrives.
    pub fn starting() -> Self {
        Self {
            status: ExecutionStatus::Processing,
            current_step: LABEL_STARTING.to_string(),
            total_steps: 1,
            ..Self::default()
        }
    }

    /// Error transition used for failures outside the event stream.
    pub fn failed(&self, label: &str, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            progress: 0.0,
            current_step: label.to_string(),
            error: Some(message.into()),
            ..self.clone()
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        self.progress.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Error,
}

/// Per-file upload progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub status: UploadStatus,
    pub progress: u8,
    pub file_name: String,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadState {
    pub fn started(file_name: &str, total_bytes: u64) -> Self {
        Self {
            status: UploadStatus::Uploading,
            progress: 0,
            file_name: file_name.to_string(),
            uploaded_bytes: 0,
            total_bytes,
            file_id: None,
            error: None,
        }
    }

    pub fn record_sent(&mut self, uploaded: u64) {
        self.uploaded_bytes = uploaded.min(self.total_bytes);
        self.progress = if self.total_bytes == 0 {
            0
        } else {
            ((self.uploaded_bytes as f64 / self.total_bytes as f64) * 100.0).round() as u8
        };
    }

    pub fn complete(&mut self, file_id: &str) {
        self.status = UploadStatus::Completed;
        self.progress = 100;
        self.uploaded_bytes = self.total_bytes;
        self.file_id = Some(file_id.to_string());
    }

    pub fn fail(&mut self, message: &str) {
        self.status = UploadStatus::Error;
        self.progress = 0;
        self.error = Some(message.to_string());
    }
}
