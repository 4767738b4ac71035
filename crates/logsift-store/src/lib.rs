//! Local cache of CI job logs
//!
//! [`LogStore`] downloads each job's log at most once at a time, keeps it on
//! disk under a byte budget and hands out [`LogLease`]s that pin a log
//! against eviction while it is being read.

pub mod error;
pub mod fetch;
pub mod index;
pub mod store;

pub use error::StoreError;
pub use fetch::{
    DEFAULT_URL_TEMPLATE, FetchFailure, HttpFetcher, LogFetcher, LogLocator, UrlTemplate,
    job_id_from_url, resolve_job,
};
pub use index::{CacheIndex, IndexEntry};
pub use store::{LogLease, LogStore, PurgeReport, RetryPolicy, StoreConfig};
