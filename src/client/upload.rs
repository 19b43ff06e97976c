use super::identity::IdentityProvider;
use super::state::{UploadState, UploadStatus};
use crate::dify::{FileUploadResult, UploadError};
use crate::error::{AppError, AppResult};
use crate::upload::{extension_of, mime_type_for, validate_file, UploadPolicy};
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use reqwest::multipart::{Form, Part};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A file held in memory, ready to upload.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub data: Bytes,
}

impl LocalFile {
    pub fn new(name: &str, data: impl Into<Bytes>) -> Self {
        Self { name: name.to_string(), data: data.into() }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::validation(format!("Not a file path: {}", path.display())))?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read {}: {e}", path.display())))?;
        Ok(Self::new(&name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

pub type UploadProgressCallback = Arc<dyn Fn(&UploadState) + Send + Sync>;

#[derive(Clone)]
pub struct UploadOptions {
    pub policy: UploadPolicy,
    pub timeout: Duration,
    pub chunk_size: usize,
    pub on_progress: Option<UploadProgressCallback>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            policy: UploadPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            on_progress: None,
        }
    }
}

impl UploadOptions {
    pub fn on_progress(mut self, f: impl Fn(&UploadState) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
struct Entries {
    next_order: u64,
    by_key: HashMap<String, (u64, UploadState)>,
}

/// Uploads files through the bridge and tracks per-file progress.
#[derive(Clone)]
pub struct UploadOrchestrator {
    http: reqwest::Client,
    base_url: String,
    identity: Option<Arc<dyn IdentityProvider>>,
    entries: Arc<Mutex<Entries>>,
    seq: Arc<AtomicU64>,
}

impl UploadOrchestrator {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            identity: None,
            entries: Arc::new(Mutex::new(Entries::default())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// `<name>-<millis>-<seq>`; the sequence separates same-name files submitted together.
    fn next_key(&self, file_name: &str) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{file_name}-{millis}-{seq}")
    }

    fn store(&self, key: &str, state: &UploadState, options: &UploadOptions) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let order = match entries.by_key.get(key) {
                Some((order, _)) => *order,
                None => {
                    entries.next_order += 1;
                    entries.next_order
                }
            };
            entries.by_key.insert(key.to_string(), (order, state.clone()));
        }
        if let Some(on_progress) = &options.on_progress {
            on_progress(state);
        }
    }

    /// Upload one file. Returns the tracking key and the result.
    ///
    /// Validation runs locally first, so a rejected file never hits the network.
    pub async fn upload_file(&self, file: &LocalFile, options: &UploadOptions) -> (String, FileUploadResult) {
        let key = self.next_key(&file.name);
        let mut state = UploadState::started(&file.name, file.size());
        self.store(&key, &state, options);

        if let Err(err) = validate_file(&file.name, file.size(), &options.policy) {
            tracing::warn!(file = %file.name, "[uploads] rejected locally: {}", err.message);
            state.fail(&err.message);
            self.store(&key, &state, options);
            return (key, FileUploadResult::Failure(err));
        }

        let result = match self.send(&key, file, options).await {
            Ok(result) => result,
            Err(err) => FileUploadResult::Failure(err),
        };
        match &result {
            FileUploadResult::Success(data) => state.complete(&data.id),
            FileUploadResult::Failure(err) => state.fail(&err.message),
        }
        self.store(&key, &state, options);
        (key, result)
    }

    /// Upload all files in parallel. Results keep input order.
    pub async fn upload_files(&self, files: &[LocalFile], options: &UploadOptions) -> Vec<FileUploadResult> {
        join_all(files.iter().map(|f| self.upload_file(f, options)))
            .await
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    async fn send(&self, key: &str, file: &LocalFile, options: &UploadOptions) -> Result<FileUploadResult, UploadError> {
        let total = file.size();
        let chunk_size = options.chunk_size.max(1);
        let chunks: Vec<Bytes> = (0..file.data.len())
            .step_by(chunk_size)
            .map(|start| file.data.slice(start..(start + chunk_size).min(file.data.len())))
            .collect();

        // Progress advances as the body is pulled onto the wire.
        let tracker = self.clone();
        let progress_key = key.to_string();
        let progress_options = options.clone();
        let file_name = file.name.clone();
        let mut sent = 0u64;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            let mut state = UploadState::started(&file_name, total);
            state.record_sent(sent);
            tracker.store(&progress_key, &state, &progress_options);
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let mime = mime_type_for(&extension_of(&file.name).unwrap_or_default());
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(file.name.clone())
            .mime_str(mime)
            .map_err(|e| UploadError::new("UPLOAD_FAILED", format!("Invalid MIME type: {e}"), 500))?;

        let mut request = self
            .http
            .post(format!("{}/upload", self.base_url))
            .timeout(options.timeout)
            .multipart(Form::new().part("file", part));
        if let Some(token) = self.identity.as_ref().and_then(|i| i.access_token()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::new("UPLOAD_FAILED", format!("Upload failed: {e}"), 500))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| UploadError::new("UPLOAD_FAILED", format!("Upload failed: {e}"), status))?;

        serde_json::from_slice::<FileUploadResult>(&body).map_err(|_| {
            let text = String::from_utf8_lossy(&body);
            let message = if text.trim().is_empty() {
                format!("Upload failed with HTTP {status}")
            } else {
                text.chars().take(200).collect()
            };
            UploadError::new("UPLOAD_FAILED", message, status)
        })
    }

    pub fn get(&self, key: &str) -> Option<UploadState> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.by_key.get(key).map(|(_, s)| s.clone())
    }

    /// All states in submission order.
    pub fn all(&self) -> Vec<UploadState> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ordered: Vec<&(u64, UploadState)> = entries.by_key.values().collect();
        ordered.sort_by_key(|(order, _)| *order);
        ordered.into_iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).by_key.clear();
    }

    pub fn remove(&self, key: &str) -> Option<UploadState> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.by_key.remove(key).map(|(_, s)| s)
    }

    /// Mean progress over all tracked files, rounded. 0 when nothing is tracked.
    pub fn total_progress(&self) -> u8 {
        let states = self.all();
        if states.is_empty() {
            return 0;
        }
        let sum: u64 = states.iter().map(|s| s.progress as u64).sum();
        (sum as f64 / states.len() as f64).round() as u8
    }

    fn count(&self, status: UploadStatus) -> usize {
        self.all().iter().filter(|s| s.status == status).count()
    }

    pub fn uploading_count(&self) -> usize {
        self.count(UploadStatus::Uploading)
    }

    pub fn completed_count(&self) -> usize {
        self.count(UploadStatus::Completed)
    }

    pub fn error_count(&self) -> usize {
        self.count(UploadStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config_for, spawn_bridge, spawn_fake_provider, FakeProvider, UploadReply};

    #[tokio::test]
    async fn test_from_path_reads_name_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balance-sheet.xlsx");
        tokio::fs::write(&path, b"PK\x03\x04").await.unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "balance-sheet.xlsx");
        assert_eq!(file.size(), 4);
        assert!(LocalFile::from_path(dir.path().join("missing.pdf")).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_files_keeps_order_and_tracks_progress() {
        let fake = spawn_fake_provider(FakeProvider::default()).await;
        let base = spawn_bridge(config_for(&fake)).await;
        let orchestrator = UploadOrchestrator::new(&base);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let options = UploadOptions { chunk_size: 4, ..UploadOptions::default() }
            .on_progress(move |s| recorder.lock().unwrap().push((s.file_name.clone(), s.progress)));

        let files = vec![
            LocalFile::new("a.pdf", vec![1u8; 10]),
            LocalFile::new("b.csv", b"x,y\n1,2\n".to_vec()),
            LocalFile::new("a.pdf", vec![2u8; 3]),
        ];
        let results = orchestrator.upload_files(&files, &options).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_success()));
        let sizes: Vec<u64> = results
            .iter()
            .map(|r| match r {
                FileUploadResult::Success(data) => data.size,
                FileUploadResult::Failure(_) => 0,
            })
            .collect();
        assert_eq!(sizes, [10, 8, 3]);

        // Same-name files submitted together get separate entries.
        assert_eq!(orchestrator.all().len(), 3);
        assert_eq!(orchestrator.completed_count(), 3);
        assert_eq!(orchestrator.total_progress(), 100);

        let seen = seen.lock().unwrap();
        let b: Vec<u8> = seen.iter().filter(|(n, _)| n == "b.csv").map(|(_, p)| *p).collect();
        assert_eq!(b.first(), Some(&0));
        assert_eq!(b.last(), Some(&100));
        assert!(b.windows(2).all(|w| w[0] <= w[1]), "{b:?}");
    }

    #[tokio::test]
    async fn test_oversize_rejected_before_network() {
        let fake = spawn_fake_provider(FakeProvider::default()).await;
        let base = spawn_bridge(config_for(&fake)).await;
        let orchestrator = UploadOrchestrator::new(&base);
        let options = UploadOptions { policy: UploadPolicy::with_max_bytes(16), ..UploadOptions::default() };

        let (key, result) = orchestrator.upload_file(&LocalFile::new("big.pdf", vec![0u8; 17]), &options).await;
        let err = result.error().unwrap();
        assert_eq!(err.code, "VALIDATION_ERROR");
        assert_eq!(orchestrator.get(&key).unwrap().status, UploadStatus::Error);

        let (_, result) = orchestrator.upload_file(&LocalFile::new("run.sh", b"#!".to_vec()), &options).await;
        assert_eq!(result.error().unwrap().status, 400);
        assert_eq!(fake.upload_hits(), 0);
        assert_eq!(orchestrator.error_count(), 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_recorded() {
        let fake = spawn_fake_provider(FakeProvider::uploads(UploadReply::Status {
            code: 400,
            body: r#"{"code":"file_too_large","message":"File size exceeded"}"#.into(),
        }))
        .await;
        let base = spawn_bridge(config_for(&fake)).await;
        let orchestrator = UploadOrchestrator::new(&base);

        let (key, result) = orchestrator
            .upload_file(&LocalFile::new("scan.pdf", b"%PDF".to_vec()), &UploadOptions::default())
            .await;
        assert_eq!(result.error().unwrap().code, "file_too_large");
        let state = orchestrator.get(&key).unwrap();
        assert_eq!(state.status, UploadStatus::Error);
        assert_eq!(state.error.as_deref(), Some("File size exceeded"));
        assert_eq!(state.progress, 0);
    }

    #[tokio::test]
    async fn test_unreachable_bridge() {
        let orchestrator = UploadOrchestrator::new("http://127.0.0.1:1");
        let (_, result) = orchestrator
            .upload_file(&LocalFile::new("a.txt", b"hi".to_vec()), &UploadOptions::default())
            .await;
        assert_eq!(result.error().unwrap().code, "UPLOAD_FAILED");
    }

    #[test]
    fn test_bookkeeping() {
        let orchestrator = UploadOrchestrator::new("http://127.0.0.1:1");
        assert_eq!(orchestrator.total_progress(), 0);

        let options = UploadOptions::default();
        let mut a = UploadState::started("a.pdf", 10);
        a.record_sent(5);
        let mut b = UploadState::started("b.pdf", 10);
        b.complete("f-2");
        orchestrator.store("a", &a, &options);
        orchestrator.store("b", &b, &options);

        assert_eq!(orchestrator.total_progress(), 75);
        assert_eq!(orchestrator.uploading_count(), 1);
        assert_eq!(orchestrator.all()[0].file_name, "a.pdf");

        assert_eq!(orchestrator.remove("a").unwrap().progress, 50);
        assert!(orchestrator.get("a").is_none());
        orchestrator.clear();
        assert!(orchestrator.all().is_empty());
    }
}
