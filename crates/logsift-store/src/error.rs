use logsift_types::JobId;
use thiserror::Error;

/// Errors from acquiring or maintaining cached logs.
///
/// Cloneable so that every caller attached to one in-flight fetch receives
/// the same failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("failed to fetch log for job {job_id}: {message}")]
    Fetch { job_id: JobId, message: String },

    #[error("no log found for job {job_id} at {url}")]
    NotFound { job_id: JobId, url: String },

    #[error("timed out acquiring log for job {0}")]
    TimedOut(JobId),

    #[error("cache I/O error: {0}")]
    Io(String),

    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(err: tempfile::PersistError) -> Self {
        StoreError::Io(err.error.to_string())
    }
}
