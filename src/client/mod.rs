//! Client-side orchestration: runs workflows through the bridge and uploads
//! documents, exposing observable state for a UI to render.

pub mod execution;
pub mod identity;
pub mod state;
pub mod upload;

pub use execution::{ExecutionOptions, WorkflowExecutor, DEFAULT_TIMEOUT};
pub use identity::{IdentityProvider, SessionState, SessionTokens, StaticTokenProvider, UserProfile};
pub use state::{ExecutionState, ExecutionStatus, UploadState, UploadStatus};
pub use upload::{LocalFile, UploadOptions, UploadOrchestrator};
