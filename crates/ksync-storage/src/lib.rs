//! Storage and fetch contracts, retry policy and backends for konnector-sync.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ksync_core::{Entry, FileDescriptor, FileMetadata, StoredRecord};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

mod http;
mod local;

pub use http::{HttpClientConfig, HttpFetcher, SimpleTokenBucket, TokenBucketConfig};
pub use local::{LocalStore, ROOT_DIR_ID};

pub const CRATE_NAME: &str = "ksync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("{path} already exists")]
    AlreadyExists { path: String },
    #[error("remote call `{operation}` timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("remote store returned status {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("disk quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::Remote { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock => RetryDisposition::Retryable,
                _ => RetryDisposition::NonRetryable,
            },
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid download url `{url}`")]
    InvalidUrl { url: String },
    #[error("downloaded file from {url} is empty")]
    EmptyBody { url: String },
    #[error("response transform failed: {0}")]
    Transform(String),
    #[error("fetcher is shutting down")]
    Shutdown,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Bytes to upload, with an optional forced content type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FileContent {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type,
        }
    }
}

impl From<FetchedResponse> for FileContent {
    fn from(response: FetchedResponse) -> Self {
        Self {
            bytes: response.body,
            content_type: response.content_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFileOptions {
    pub name: String,
    pub dir_id: String,
    pub content_type: Option<String>,
    pub metadata: Option<FileMetadata>,
}

/// Query for non-trashed files created by `created_by_app` for
/// `source_account_identifier` with the given fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    pub file_id_attributes: String,
    pub source_account_identifier: String,
    pub created_by_app: String,
    pub trashed: bool,
}

impl FileSelector {
    pub fn matches(&self, file: &FileDescriptor) -> bool {
        let Some(metadata) = &file.metadata else {
            return false;
        };
        file.trashed == self.trashed
            && metadata.file_id_attributes.as_deref() == Some(self.file_id_attributes.as_str())
            && metadata.source_account_identifier.as_deref()
                == Some(self.source_account_identifier.as_str())
            && metadata.created_by_app.as_deref() == Some(self.created_by_app.as_str())
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn list_all(&self, model: &str) -> Result<Vec<StoredRecord>, StorageError>;

    async fn create(&self, model: &str, entry: &Entry) -> Result<StoredRecord, StorageError>;

    async fn update_attributes(
        &self,
        model: &str,
        id: &str,
        changes: &Entry,
    ) -> Result<StoredRecord, StorageError>;

    /// `Ok(None)` is the definite "no such file" answer.
    async fn stat_by_path(&self, path: &str) -> Result<Option<FileDescriptor>, StorageError>;

    async fn query_files_by_metadata(
        &self,
        selector: &FileSelector,
    ) -> Result<Vec<FileDescriptor>, StorageError>;

    /// Creates `path` and its missing parents. Existing directories are not an error.
    async fn create_directory(&self, path: &str) -> Result<FileDescriptor, StorageError>;

    async fn create_file(
        &self,
        content: FileContent,
        options: &CreateFileOptions,
    ) -> Result<FileDescriptor, StorageError>;

    /// Moves a file to the trash. Trashed files are invisible to path lookups
    /// and to non-trashed metadata queries.
    async fn trash_file(&self, id: &str) -> Result<FileDescriptor, StorageError>;
}

#[async_trait]
impl<T: StorageClient + ?Sized> StorageClient for Arc<T> {
    async fn list_all(&self, model: &str) -> Result<Vec<StoredRecord>, StorageError> {
        (**self).list_all(model).await
    }

    async fn create(&self, model: &str, entry: &Entry) -> Result<StoredRecord, StorageError> {
        (**self).create(model, entry).await
    }

    async fn update_attributes(
        &self,
        model: &str,
        id: &str,
        changes: &Entry,
    ) -> Result<StoredRecord, StorageError> {
        (**self).update_attributes(model, id, changes).await
    }

    async fn stat_by_path(&self, path: &str) -> Result<Option<FileDescriptor>, StorageError> {
        (**self).stat_by_path(path).await
    }

    async fn query_files_by_metadata(
        &self,
        selector: &FileSelector,
    ) -> Result<Vec<FileDescriptor>, StorageError> {
        (**self).query_files_by_metadata(selector).await
    }

    async fn create_directory(&self, path: &str) -> Result<FileDescriptor, StorageError> {
        (**self).create_directory(path).await
    }

    async fn create_file(
        &self,
        content: FileContent,
        options: &CreateFileOptions,
    ) -> Result<FileDescriptor, StorageError> {
        (**self).create_file(content, options).await
    }

    async fn trash_file(&self, id: &str) -> Result<FileDescriptor, StorageError> {
        (**self).trash_file(id).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadMethod {
    #[default]
    Get,
    Post,
}

/// Per-download request shape. `form` is sent url-encoded with a POST.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    #[serde(default)]
    pub method: DownloadMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub form: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<FetchedResponse, FetchError>;
}

/// Hook turning a raw response into the payload to upload.
pub trait ResponseTransform: Send + Sync {
    fn transform(&self, response: FetchedResponse) -> Result<FileContent, FetchError>;
}

impl<F> ResponseTransform for F
where
    F: Fn(FetchedResponse) -> Result<FileContent, FetchError> + Send + Sync,
{
    fn transform(&self, response: FetchedResponse) -> Result<FileContent, FetchError> {
        self(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Timeout and retry budget applied to every store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCallPolicy {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RemoteCallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Runs an idempotent store call, retrying timeouts and retryable failures.
pub async fn call_with_policy<T, F, Fut>(
    policy: &RemoteCallPolicy,
    operation: &str,
    call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    run_with_policy(policy, operation, true, call).await
}

/// Runs a call that may have taken effect even when its reply never came.
/// A timeout is returned as is; refusals the store reported are retried.
pub async fn call_non_idempotent<T, F, Fut>(
    policy: &RemoteCallPolicy,
    operation: &str,
    call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    run_with_policy(policy, operation, false, call).await
}

async fn run_with_policy<T, F, Fut>(
    policy: &RemoteCallPolicy,
    operation: &str,
    retry_timeouts: bool,
    mut call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0usize;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StorageError::Timeout {
                operation: operation.to_string(),
                after: policy.timeout,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err @ StorageError::Timeout { .. }) if !retry_timeouts => {
                warn!(operation, attempt, error = %err, "write timed out, not retried");
                return Err(err);
            }
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.backoff.max_retries =>
            {
                let delay = policy.backoff.delay_for_attempt(attempt);
                warn!(operation, attempt, ?delay, error = %err, "retrying store call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decorator running each call of the wrapped client under a [`RemoteCallPolicy`].
#[derive(Debug, Clone)]
pub struct RetryingStorage<S> {
    inner: S,
    policy: RemoteCallPolicy,
}

impl<S> RetryingStorage<S> {
    pub fn new(inner: S, policy: RemoteCallPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: StorageClient> StorageClient for RetryingStorage<S> {
    async fn list_all(&self, model: &str) -> Result<Vec<StoredRecord>, StorageError> {
        call_with_policy(&self.policy, "list_all", || self.inner.list_all(model)).await
    }

    async fn create(&self, model: &str, entry: &Entry) -> Result<StoredRecord, StorageError> {
        call_non_idempotent(&self.policy, "create", || self.inner.create(model, entry)).await
    }

    async fn update_attributes(
        &self,
        model: &str,
        id: &str,
        changes: &Entry,
    ) -> Result<StoredRecord, StorageError> {
        call_with_policy(&self.policy, "update_attributes", || {
            self.inner.update_attributes(model, id, changes)
        })
        .await
    }

    async fn stat_by_path(&self, path: &str) -> Result<Option<FileDescriptor>, StorageError> {
        call_with_policy(&self.policy, "stat_by_path", || self.inner.stat_by_path(path)).await
    }

    async fn query_files_by_metadata(
        &self,
        selector: &FileSelector,
    ) -> Result<Vec<FileDescriptor>, StorageError> {
        call_with_policy(&self.policy, "query_files_by_metadata", || {
            self.inner.query_files_by_metadata(selector)
        })
        .await
    }

    async fn create_directory(&self, path: &str) -> Result<FileDescriptor, StorageError> {
        call_with_policy(&self.policy, "create_directory", || {
            self.inner.create_directory(path)
        })
        .await
    }

    async fn create_file(
        &self,
        content: FileContent,
        options: &CreateFileOptions,
    ) -> Result<FileDescriptor, StorageError> {
        call_non_idempotent(&self.policy, "create_file", || {
            self.inner.create_file(content.clone(), options)
        })
        .await
    }

    async fn trash_file(&self, id: &str) -> Result<FileDescriptor, StorageError> {
        call_with_policy(&self.policy, "trash_file", || self.inner.trash_file(id)).await
    }
}
