use crate::error::AppError;
use crate::form::{LoanApplicationForm, WorkflowInputs};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------- Workflow invocation ----------

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Streaming,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Document,
    Image,
    Audio,
    Video,
}

/// How the provider locates a file. Only previously uploaded files are referenced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    LocalFile,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileReference {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub transfer_method: TransferMethod,
    pub upload_file_id: String,
}

/// Body of `POST /workflows/run`. Built once per execution attempt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowInvocation {
    inputs: WorkflowInputs,
    response_mode: ResponseMode,
    user: String,
    files: Vec<FileReference>,
}

impl WorkflowInvocation {
    pub fn new(form: &LoanApplicationForm, file_ids: &[String], user: &str) -> Self {
        let files = file_ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .map(|id| FileReference {
                kind: FileKind::Document,
                transfer_method: TransferMethod::LocalFile,
                upload_file_id: id.clone(),
            })
            .collect();
        Self {
            inputs: form.to_inputs(),
            response_mode: ResponseMode::Streaming,
            user: user.to_string(),
            files,
        }
    }

    pub fn inputs(&self) -> &WorkflowInputs {
        &self.inputs
    }

    pub fn files(&self) -> &[FileReference] {
        &self.files
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

// ---------- Stream events ----------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WorkflowRunData {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub elapsed_time: Option<f64>,
    pub total_tokens: Option<u64>,
    pub total_steps: Option<u64>,
    pub created_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NodeData {
    pub id: String,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    pub index: u32,
    pub predecessor_node_id: Option<String>,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
    pub elapsed_time: Option<f64>,
    pub created_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TextChunkData {
    pub text: String,
    pub from_variable_selector: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ErrorData {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// One event of the provider's workflow stream, discriminated by `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProviderEvent {
    WorkflowStarted {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        #[serde(default)]
        data: WorkflowRunData,
    },
    NodeStarted {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        data: NodeData,
    },
    NodeFinished {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        data: NodeData,
    },
    WorkflowFinished {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        data: WorkflowRunData,
    },
    TextChunk {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        #[serde(default)]
        data: TextChunkData,
    },
    TtsMessage {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        message_id: String,
        #[serde(default)]
        audio: String,
    },
    TtsMessageEnd {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        message_id: String,
        #[serde(default)]
        audio: String,
    },
    /// The provider nests error details under `data` in some versions and
    /// puts them at the top level in others; both are accepted.
    Error {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        workflow_run_id: String,
        #[serde(default)]
        data: Option<ErrorData>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        status: Option<u16>,
    },
    Ping,
    #[serde(other)]
    Other,
}

impl ProviderEvent {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProviderEvent::Error { data, message, .. } => data
                .as_ref()
                .and_then(|d| d.message.as_deref())
                .or(message.as_deref())
                .filter(|m| !m.is_empty()),
            ProviderEvent::WorkflowFinished { data, .. } => data.error.as_deref().filter(|m| !m.is_empty()),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ProviderEvent::Error { data, code, .. } => data
                .as_ref()
                .and_then(|d| d.code.as_deref())
                .or(code.as_deref()),
            _ => None,
        }
    }
}

/// A decoded stream event plus the exact JSON it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event: ProviderEvent,
    pub raw: Value,
}

impl DecodedEvent {
    /// Tags carrying CR or LF are rejected: the tag becomes the downstream
    /// SSE event name, which must be a single line.
    pub fn decode(payload: &str) -> Result<Self, AppError> {
        let raw: Value = serde_json::from_str(payload).map_err(|e| AppError::UpstreamProtocol(e.to_string()))?;
        if let Some(tag) = raw.get("event").and_then(Value::as_str) {
            if tag.contains(['\r', '\n']) {
                return Err(AppError::UpstreamProtocol(format!("event tag spans lines: {tag:?}")));
            }
        }
        let event = ProviderEvent::deserialize(&raw).map_err(|e| AppError::UpstreamProtocol(e.to_string()))?;
        Ok(Self { event, raw })
    }

    /// The provider's own tag, including tags this crate does not model.
    pub fn tag(&self) -> &str {
        self.raw.get("event").and_then(|v| v.as_str()).unwrap_or("unknown")
    }
}

// ---------- File upload ----------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DifyFileUploadResponse {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadError {
    pub code: String,
    pub message: String,
    pub status: u16,
}

impl UploadError {
    pub fn new(code: &str, message: impl Into<String>, status: u16) -> Self {
        Self { code: code.to_string(), message: message.into(), status }
    }
}

/// `{success:true,data}` or `{success:false,error}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(into = "UploadEnvelope", try_from = "UploadEnvelope")]
pub enum FileUploadResult {
    Success(DifyFileUploadResponse),
    Failure(UploadError),
}

impl FileUploadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FileUploadResult::Success(_))
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            FileUploadResult::Success(data) => Some(&data.id),
            FileUploadResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&UploadError> {
        match self {
            FileUploadResult::Success(_) => None,
            FileUploadResult::Failure(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadEnvelope {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<DifyFileUploadResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<UploadError>,
}

impl From<FileUploadResult> for UploadEnvelope {
    fn from(result: FileUploadResult) -> Self {
        match result {
            FileUploadResult::Success(data) => Self { success: true, data: Some(data), error: None },
            FileUploadResult::Failure(error) => Self { success: false, data: None, error: Some(error) },
        }
    }
}

impl TryFrom<UploadEnvelope> for FileUploadResult {
    type Error = String;

    fn try_from(env: UploadEnvelope) -> Result<Self, Self::Error> {
        match (env.success, env.data, env.error) {
            (true, Some(data), _) => Ok(FileUploadResult::Success(data)),
            (false, _, Some(error)) => Ok(FileUploadResult::Failure(error)),
            (true, None, _) => Err("upload result marked success without data".into()),
            (false, _, None) => Err("upload result marked failure without error".into()),
        }
    }
}
