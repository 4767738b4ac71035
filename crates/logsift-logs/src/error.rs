use logsift_store::StoreError;
use thiserror::Error;

/// Errors raised by the analysis passes.
///
/// Empty results and truncation are not errors; they are reported on the
/// result containers themselves.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("unknown match category '{0}'")]
    UnknownCategory(String),

    #[error("unknown test dialect '{0}'")]
    UnknownDialect(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
