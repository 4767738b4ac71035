//! Network side of the store: resolving job ids to URLs and downloading

use std::time::Duration;

use async_trait::async_trait;
use logsift_types::JobId;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::StoreError;

/// Placeholder substituted by [`UrlTemplate`]
pub const JOB_ID_PLACEHOLDER: &str = "{job_id}";

/// Public raw-log location for CI jobs
pub const DEFAULT_URL_TEMPLATE: &str = "https://ossci-raw-job-status.s3.amazonaws.com/log/{job_id}";

/// Why a single download attempt failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchFailure {
    /// The source does not know this log; retrying will not help
    NotFound(u16),
    /// Network trouble or a server-side error worth retrying
    Transient(String),
    /// Any other rejection
    Permanent(String),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::NotFound(status) => write!(f, "not found (HTTP {})", status),
            FetchFailure::Transient(msg) | FetchFailure::Permanent(msg) => f.write_str(msg),
        }
    }
}

/// Downloads a log body into a sink
#[async_trait]
pub trait LogFetcher: Send + Sync {
    /// Stream the body at `url` into `sink`, returning the bytes written
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, FetchFailure>;
}

/// Resolves a job id to the URL its log lives at
pub trait LogLocator: Send + Sync {
    fn locate(&self, job_id: JobId) -> String;
}

/// A URL pattern containing `{job_id}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, StoreError> {
        let template = template.into();
        if !template.contains(JOB_ID_PLACEHOLDER) {
            return Err(StoreError::Config(format!(
                "url template '{}' lacks {}",
                template, JOB_ID_PLACEHOLDER
            )));
        }
        Ok(Self(template))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UrlTemplate {
    fn default() -> Self {
        Self(DEFAULT_URL_TEMPLATE.to_string())
    }
}

impl LogLocator for UrlTemplate {
    fn locate(&self, job_id: JobId) -> String {
        self.0.replace(JOB_ID_PLACEHOLDER, &job_id.to_string())
    }
}

/// Job id carried by a raw log URL, taken from its last path segment
pub fn job_id_from_url(url: &str) -> Option<JobId> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    segment.parse::<u64>().ok().map(JobId)
}

/// Resolve a command-line job reference (a numeric id or a raw log URL)
/// to the job id and the URL to fetch it from
pub fn resolve_job(input: &str, locator: &dyn LogLocator) -> Result<(JobId, String), StoreError> {
    let input = input.trim();
    if let Ok(id) = input.parse::<u64>() {
        let job_id = JobId(id);
        return Ok((job_id, locator.locate(job_id)));
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        if let Some(job_id) = job_id_from_url(input) {
            return Ok((job_id, input.to_string()));
        }
    }
    Err(StoreError::NotFound {
        job_id: JobId(0),
        url: input.to_string(),
    })
}

/// Fetches logs over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("logsift/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LogFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, FetchFailure> {
        let mut response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchFailure::NotFound(status.as_u16()));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchFailure::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchFailure::Permanent(format!("HTTP {}", status)));
        }

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            sink.write_all(&chunk)
                .await
                .map_err(|e| FetchFailure::Permanent(format!("write failed: {}", e)))?;
            written += chunk.len() as u64;
        }
        sink.flush()
            .await
            .map_err(|e| FetchFailure::Permanent(format!("write failed: {}", e)))?;

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}

fn classify(err: reqwest::Error) -> FetchFailure {
    if err.is_builder() {
        FetchFailure::Permanent(err.to_string())
    } else {
        FetchFailure::Transient(err.to_string())
    }
}
