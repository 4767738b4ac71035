//! The local log store
//!
//! Logs are downloaded once per job id into the cache root and then read
//! directly from disk. Concurrent acquisitions of the same job share one
//! download; the download streams into a temporary file that is renamed into
//! place only when complete.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use logsift_types::{HandleState, JobId, LogHandle};

use crate::error::StoreError;
use crate::fetch::{FetchFailure, LogFetcher};
use crate::index::{
    CacheIndex, IndexEntry, PARTIAL_PREFIX, STALE_PARTIAL_AGE, log_file_name, remove_partials,
};

/// Times a caller re-attaches after its log was evicted before it could read it
const MAX_ACQUIRE_ROUNDS: usize = 3;

/// Retry behaviour for transient download failures
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before retry `n` is `backoff_base * 2^(n-1)`
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub budget_bytes: u64,
    pub retry: RetryPolicy,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            root: root.into(),
            budget_bytes,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of [`LogStore::purge`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: Vec<JobId>,
    pub bytes_freed: u64,
}

type FetchResult = Result<LogHandle, StoreError>;
type FetchFuture = BoxFuture<'static, FetchResult>;

struct State {
    index: CacheIndex,
    /// In-flight downloads. Weak so an abandoned download is dropped.
    fetching: HashMap<JobId, WeakShared<FetchFuture>>,
    /// Open leases per job
    readers: HashMap<JobId, usize>,
    /// Jobs whose last download failed
    failed: HashSet<JobId>,
    /// Index has unsaved access times
    dirty: bool,
}

struct Inner {
    config: StoreConfig,
    fetcher: Arc<dyn LogFetcher>,
    state: Mutex<State>,
}

/// Cache of downloaded job logs under a byte budget
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Inner>,
}

impl LogStore {
    /// Open (creating if needed) the cache at `config.root`
    pub fn open(config: StoreConfig, fetcher: Arc<dyn LogFetcher>) -> Result<Self, StoreError> {
        if config.budget_bytes == 0 {
            return Err(StoreError::Config("cache budget must be positive".into()));
        }
        if config.retry.attempts == 0 {
            return Err(StoreError::Config("fetch attempts must be at least 1".into()));
        }
        fs::create_dir_all(&config.root)?;
        remove_partials(&config.root, STALE_PARTIAL_AGE)?;
        let index = CacheIndex::load_or_rebuild(&config.root)?;
        debug!(
            "Opened log cache at {} ({} logs, {} bytes)",
            config.root.display(),
            index.entries.len(),
            index.total_bytes()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                state: Mutex::new(State {
                    index,
                    fetching: HashMap::new(),
                    readers: HashMap::new(),
                    failed: HashSet::new(),
                    dirty: false,
                }),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Get a readable log for `job_id`, downloading it from `source_url` if
    /// it is not cached. Callers racing on the same job share one download.
    pub async fn acquire(&self, job_id: JobId, source_url: &str) -> Result<LogLease, StoreError> {
        for _ in 0..MAX_ACQUIRE_ROUNDS {
            let fetch = {
                let mut state = self.inner.state.lock();
                if let Some(lease) = self.inner.lease(&mut state, job_id) {
                    return Ok(lease);
                }
                match state.fetching.get(&job_id).and_then(WeakShared::upgrade) {
                    Some(fetch) => {
                        debug!("Joining in-flight fetch for job {}", job_id);
                        fetch
                    }
                    None => {
                        let fetch: Shared<FetchFuture> =
                            Inner::start_fetch(&self.inner, job_id, source_url.to_string())
                                .shared();
                        if let Some(weak) = fetch.downgrade() {
                            state.fetching.insert(job_id, weak);
                        }
                        fetch
                    }
                }
            };

            fetch.await?;
        }

        Err(StoreError::Fetch {
            job_id,
            message: "log was evicted before it could be read".into(),
        })
    }

    /// [`acquire`](Self::acquire) bounded by a deadline. An expired deadline
    /// abandons the download unless other callers are still waiting on it.
    pub async fn acquire_until(
        &self,
        job_id: JobId,
        source_url: &str,
        deadline: Option<Instant>,
    ) -> Result<LogLease, StoreError> {
        match deadline {
            None => self.acquire(job_id, source_url).await,
            Some(deadline) => tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline),
                self.acquire(job_id, source_url),
            )
            .await
            .map_err(|_| StoreError::TimedOut(job_id))?,
        }
    }

    /// Whether a complete log for `job_id` is cached
    pub fn contains(&self, job_id: JobId) -> bool {
        self.inner.state.lock().index.entries.contains_key(&job_id)
    }

    /// Where `job_id` is in its lifecycle as seen by this store
    pub fn state(&self, job_id: JobId) -> HandleState {
        let state = self.inner.state.lock();
        if state
            .fetching
            .get(&job_id)
            .is_some_and(|weak| weak.upgrade().is_some())
        {
            HandleState::Fetching
        } else if state.index.entries.contains_key(&job_id) {
            HandleState::Ready
        } else if state.failed.contains(&job_id) {
            HandleState::Failed
        } else {
            HandleState::Pending
        }
    }

    /// Bytes held by cached logs
    pub fn total_bytes(&self) -> u64 {
        self.inner.state.lock().index.total_bytes()
    }

    /// Mark `job_id` as the first candidate for eviction
    pub fn release(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(entry) = state.index.entries.get_mut(&job_id) {
            entry.last_access = DateTime::<Utc>::UNIX_EPOCH;
            state.dirty = true;
        }
        self.inner.enforce_budget(state, None);
        self.inner.save_if_dirty(state)
    }

    /// Remove logs fetched more than `older_than` ago that nobody is reading
    pub fn purge(&self, older_than: Duration) -> Result<PurgeReport, StoreError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|_| StoreError::Config("purge age out of range".into()))?;
        let cutoff = Utc::now() - age;

        let mut state = self.inner.state.lock();
        self.inner.reconcile(&mut state);
        let stale: Vec<JobId> = state
            .index
            .entries
            .iter()
            .filter(|(id, e)| e.fetched_at < cutoff && !state.readers.contains_key(*id))
            .map(|(id, _)| *id)
            .collect();

        let mut report = PurgeReport::default();
        for job_id in stale {
            if let Some(size) = self.inner.remove(&mut state, job_id) {
                report.removed.push(job_id);
                report.bytes_freed += size;
            }
        }
        info!(
            "Purged {} logs ({} bytes)",
            report.removed.len(),
            report.bytes_freed
        );
        self.inner.save_if_dirty(&mut state)?;
        Ok(report)
    }

    /// Persist access times recorded since the last save
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        self.inner.save_if_dirty(&mut state)
    }
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStore")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn log_path(&self, job_id: JobId) -> PathBuf {
        self.config.root.join(log_file_name(job_id))
    }

    /// Lease a cached log, if there is one
    fn lease(self: &Arc<Self>, state: &mut State, job_id: JobId) -> Option<LogLease> {
        let path = self.log_path(job_id);
        if !path.is_file() {
            if state.index.entries.remove(&job_id).is_some() {
                warn!("Cached log for job {} disappeared", job_id);
                state.dirty = true;
            }
            return None;
        }
        if !state.index.entries.contains_key(&job_id) {
            // Cached by another store on this root
            self.reconcile(state);
        }
        let entry = state.index.entries.get_mut(&job_id)?;
        entry.last_access = Utc::now();
        let handle = LogHandle {
            job_id,
            source_url: entry.source_url.clone(),
            local_path: Some(path.clone()),
            size_bytes: entry.size_bytes,
            fetched_at: entry.fetched_at,
            state: HandleState::Ready,
        };
        state.dirty = true;
        *state.readers.entry(job_id).or_default() += 1;

        Some(LogLease {
            store: Arc::clone(self),
            handle,
            path,
        })
    }

    fn start_fetch(this: &Arc<Self>, job_id: JobId, source_url: String) -> FetchFuture {
        let inner = Arc::clone(this);
        async move {
            let result = inner.download(job_id, &source_url).await;

            let mut state = inner.state.lock();
            state.fetching.remove(&job_id);
            let handle = match result {
                Ok(handle) => handle,
                Err(e) => {
                    state.failed.insert(job_id);
                    return Err(e);
                }
            };
            state.failed.remove(&job_id);
            // Count logs other stores on this root added since we loaded
            inner.reconcile(&mut state);
            state.index.entries.insert(
                job_id,
                IndexEntry {
                    source_url: handle.source_url.clone(),
                    size_bytes: handle.size_bytes,
                    fetched_at: handle.fetched_at,
                    last_access: handle.fetched_at,
                },
            );
            state.dirty = true;
            inner.enforce_budget(&mut state, Some(job_id));
            if let Err(e) = inner.save_if_dirty(&mut state) {
                warn!("Failed to save cache index: {}", e);
            }
            Ok(handle)
        }
        .boxed()
    }

    /// Download with retries into a temporary file, then rename into place
    async fn download(&self, job_id: JobId, url: &str) -> Result<LogHandle, StoreError> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("Fetching log for job {} (attempt {})", job_id, attempt);

            let partial = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempfile_in(&self.config.root)?;
            let mut file = tokio::fs::File::from_std(partial.as_file().try_clone()?);

            match self.fetcher.fetch(url, &mut file).await {
                Ok(_) => {
                    file.flush().await?;
                    drop(file);
                    let path = self.log_path(job_id);
                    partial.persist(&path)?;
                    let size_bytes = fs::metadata(&path)?.len();
                    info!("Cached log for job {} ({} bytes)", job_id, size_bytes);
                    return Ok(LogHandle {
                        job_id,
                        source_url: url.to_string(),
                        local_path: Some(path),
                        size_bytes,
                        fetched_at: Utc::now(),
                        state: HandleState::Ready,
                    });
                }
                Err(FetchFailure::NotFound(status)) => {
                    debug!("Job {} not found (HTTP {})", job_id, status);
                    return Err(StoreError::NotFound {
                        job_id,
                        url: url.to_string(),
                    });
                }
                Err(FetchFailure::Transient(msg)) if attempt < retry.attempts => {
                    let delay = retry.delay(attempt);
                    warn!(
                        "Fetch of job {} failed: {}; retrying in {:?}",
                        job_id, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    warn!("Giving up on job {} after {} attempt(s)", job_id, attempt);
                    return Err(StoreError::Fetch {
                        job_id,
                        message: format!("{} (after {} attempt(s))", failure, attempt),
                    });
                }
            }
        }
    }

    /// Remove a log file and its index entry, returning the bytes freed
    fn remove(&self, state: &mut State, job_id: JobId) -> Option<u64> {
        match fs::remove_file(self.log_path(job_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove log for job {}: {}", job_id, e);
                return None;
            }
        }
        state.dirty = true;
        state.index.entries.remove(&job_id).map(|e| e.size_bytes)
    }

    /// Evict least recently used logs until the cache fits its budget.
    /// Logs being read, and `keep`, are never evicted.
    fn enforce_budget(&self, state: &mut State, keep: Option<JobId>) {
        let budget = self.config.budget_bytes;
        let mut total = state.index.total_bytes();
        if total <= budget {
            return;
        }

        for job_id in state.index.lru_order() {
            if total <= budget {
                break;
            }
            if Some(job_id) == keep || state.readers.contains_key(&job_id) {
                continue;
            }
            if let Some(size) = self.remove(state, job_id) {
                total = total.saturating_sub(size);
                info!("Evicted log for job {} ({} bytes)", job_id, size);
            }
        }

        if total > budget {
            debug!(
                "Cache over budget ({} > {} bytes) while logs are in use",
                total, budget
            );
        }
    }

    /// Merge in changes made by other stores sharing the root
    fn reconcile(&self, state: &mut State) {
        match state.index.reconcile(&self.config.root) {
            Ok(changed) => state.dirty |= changed,
            Err(e) => warn!("Failed to reconcile cache index: {}", e),
        }
    }

    fn save_if_dirty(&self, state: &mut State) -> Result<(), StoreError> {
        if state.dirty {
            self.reconcile(state);
            state.index.save(&self.config.root)?;
            state.dirty = false;
        }
        Ok(())
    }

    fn end_read(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let remaining = match state.readers.get_mut(&job_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.readers.remove(&job_id);
            self.enforce_budget(&mut state, None);
        }
    }
}

/// A cached log held open for reading. The log cannot be evicted while any
/// lease on it is alive.
pub struct LogLease {
    store: Arc<Inner>,
    handle: LogHandle,
    path: PathBuf,
}

impl LogLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> &LogHandle {
        &self.handle
    }
}

impl Deref for LogLease {
    type Target = LogHandle;

    fn deref(&self) -> &LogHandle {
        &self.handle
    }
}

impl fmt::Debug for LogLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogLease").field("handle", &self.handle).finish()
    }
}

impl Drop for LogLease {
    fn drop(&mut self) {
        self.store.end_read(self.handle.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncWrite;

    /// Serves a fixed body, optionally failing the first few attempts
    struct FakeFetcher {
        body: &'static str,
        delay: Duration,
        calls: AtomicUsize,
        transient_failures: usize,
        outcome: Option<FetchFailure>,
    }

    impl FakeFetcher {
        fn serving(body: &'static str) -> Self {
            Self {
                body,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                transient_failures: 0,
                outcome: None,
            }
        }

        fn failing(failure: FetchFailure) -> Self {
            Self {
                outcome: Some(failure),
                ..Self::serving("")
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _url: &str,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, FetchFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(failure) = &self.outcome {
                return Err(failure.clone());
            }
            if call < self.transient_failures {
                return Err(FetchFailure::Transient("connection reset".into()));
            }
            sink.write_all(self.body.as_bytes()).await.unwrap();
            Ok(self.body.len() as u64)
        }
    }

    fn open(dir: &TempDir, budget_bytes: u64, fetcher: &Arc<FakeFetcher>) -> LogStore {
        let mut config = StoreConfig::new(dir.path(), budget_bytes);
        config.retry.backoff_base = Duration::from_millis(1);
        LogStore::open(config, Arc::clone(fetcher) as Arc<dyn LogFetcher>).unwrap()
    }

    fn partials(dir: &TempDir) -> usize {
        fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PARTIAL_PREFIX)
            })
            .count()
    }

    #[tokio::test]
    async fn test_single_flight() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_millis(50),
            ..FakeFetcher::serving("line one\nline two\n")
        });
        let store = open(&dir, 1 << 20, &fetcher);

        let acquisitions = (0..8).map(|_| store.acquire(JobId(1), "https://logs.example/1"));
        let leases = futures::future::join_all(acquisitions).await;

        assert_eq!(fetcher.calls(), 1);
        for lease in &leases {
            let lease = lease.as_ref().unwrap();
            assert!(lease.is_ready());
            assert_eq!(lease.size_bytes, 18);
            assert_eq!(
                fs::read_to_string(lease.path()).unwrap(),
                "line one\nline two\n"
            );
        }
    }

    #[tokio::test]
    async fn test_cached_log_is_not_refetched() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::serving("x\n"));
        let store = open(&dir, 1 << 20, &fetcher);

        drop(store.acquire(JobId(1), "u").await.unwrap());
        drop(store.acquire(JobId(1), "u").await.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            transient_failures: 2,
            ..FakeFetcher::serving("ok\n")
        });
        let store = open(&dir, 1 << 20, &fetcher);

        let lease = store.acquire(JobId(3), "u").await.unwrap();
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(lease.source_url, "u");
        assert_eq!(partials(&dir), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_remove_handle() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::failing(FetchFailure::Transient(
            "timeout".into(),
        )));
        let store = open(&dir, 1 << 20, &fetcher);

        let waiters = (0..3).map(|_| store.acquire(JobId(4), "u"));
        let results = futures::future::join_all(waiters).await;
        assert_eq!(fetcher.calls(), 3);
        let errors: Vec<StoreError> = results.into_iter().map(|r| r.unwrap_err()).collect();
        assert!(matches!(errors[0], StoreError::Fetch { .. }));
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert!(!store.contains(JobId(4)));
        assert_eq!(partials(&dir), 0);

        // A later call starts from scratch
        assert!(store.acquire(JobId(4), "u").await.is_err());
        assert_eq!(fetcher.calls(), 6);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::failing(FetchFailure::NotFound(404)));
        let store = open(&dir, 1 << 20, &fetcher);

        let err = store.acquire(JobId(5), "https://logs.example/5").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::NotFound {
                job_id: JobId(5),
                url: "https://logs.example/5".into()
            }
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::failing(FetchFailure::Permanent(
            "HTTP 403".into(),
        )));
        let store = open(&dir, 1 << 20, &fetcher);

        assert!(matches!(
            store.acquire(JobId(6), "u").await,
            Err(StoreError::Fetch { .. })
        ));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_eviction_skips_leased_logs() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::serving("12345\n"));
        let store = open(&dir, 10, &fetcher);

        let first = store.acquire(JobId(1), "u").await.unwrap();
        let second = store.acquire(JobId(2), "u").await.unwrap();
        // Over budget, but both are in use
        assert!(store.contains(JobId(1)));
        assert!(store.contains(JobId(2)));
        assert!(first.path().exists());

        drop(first);
        assert!(!store.contains(JobId(1)));
        assert!(store.contains(JobId(2)));
        assert!(second.path().exists());
        assert_eq!(store.total_bytes(), 6);
    }

    #[tokio::test]
    async fn test_release_prefers_eviction() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::serving("12345\n"));
        let store = open(&dir, 12, &fetcher);

        drop(store.acquire(JobId(1), "u").await.unwrap());
        drop(store.acquire(JobId(2), "u").await.unwrap());
        store.release(JobId(2)).unwrap();
        assert!(store.contains(JobId(2)));

        drop(store.acquire(JobId(3), "u").await.unwrap());
        assert!(store.contains(JobId(1)));
        assert!(!store.contains(JobId(2)));
        assert!(store.contains(JobId(3)));
    }

    #[tokio::test]
    async fn test_reopen_uses_index() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::serving("persisted\n"));
        {
            let store = open(&dir, 1 << 20, &fetcher);
            drop(store.acquire(JobId(8), "https://logs.example/8").await.unwrap());
            store.flush().unwrap();
        }

        let refetcher = Arc::new(FakeFetcher::serving("other\n"));
        let store = open(&dir, 1 << 20, &refetcher);
        let lease = store.acquire(JobId(8), "https://logs.example/8").await.unwrap();
        assert_eq!(refetcher.calls(), 0);
        assert_eq!(lease.source_url, "https://logs.example/8");
        assert_eq!(fs::read_to_string(lease.path()).unwrap(), "persisted\n");
    }

    #[tokio::test]
    async fn test_purge() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::serving("abc\n"));
        let store = open(&dir, 1 << 20, &fetcher);

        drop(store.acquire(JobId(1), "u").await.unwrap());
        let held = store.acquire(JobId(2), "u").await.unwrap();

        let report = store.purge(Duration::ZERO).unwrap();
        assert_eq!(report.removed, vec![JobId(1)]);
        assert_eq!(report.bytes_freed, 4);
        assert!(held.path().exists());

        let report = store.purge(Duration::from_secs(3600)).unwrap();
        assert!(report.removed.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_abandons_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_secs(30),
            ..FakeFetcher::serving("slow\n")
        });
        let store = open(&dir, 1 << 20, &fetcher);

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = store
            .acquire_until(JobId(9), "u", Some(deadline))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::TimedOut(JobId(9)));
        assert!(!store.contains(JobId(9)));
        assert_eq!(partials(&dir), 0);
    }

    #[tokio::test]
    async fn test_handle_state_follows_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_millis(100),
            ..FakeFetcher::serving("ok\n")
        });
        let store = open(&dir, 1 << 20, &fetcher);
        assert_eq!(store.state(JobId(1)), HandleState::Pending);

        let (lease, during) = tokio::join!(store.acquire(JobId(1), "u"), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.state(JobId(1))
        });
        assert_eq!(during, HandleState::Fetching);
        assert!(lease.unwrap().is_ready());
        assert_eq!(store.state(JobId(1)), HandleState::Ready);

        let missing_dir = TempDir::new().unwrap();
        let missing = open(
            &missing_dir,
            1 << 20,
            &Arc::new(FakeFetcher::failing(FetchFailure::NotFound(404))),
        );
        assert!(missing.acquire(JobId(2), "u").await.is_err());
        assert_eq!(missing.state(JobId(2)), HandleState::Failed);
    }

    #[tokio::test]
    async fn test_second_store_spares_running_download() {
        let dir = TempDir::new().unwrap();
        let slow = Arc::new(FakeFetcher {
            delay: Duration::from_millis(300),
            ..FakeFetcher::serving("slow body\n")
        });
        let idle = Arc::new(FakeFetcher::serving("other\n"));
        let first = open(&dir, 1 << 20, &slow);

        let (acquired, (live_partials, second)) = tokio::join!(first.acquire(JobId(1), "u"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let live = partials(&dir);
            (live, open(&dir, 1 << 20, &idle))
        });
        assert_eq!(live_partials, 1);
        let lease = acquired.unwrap();
        assert_eq!(fs::read_to_string(lease.path()).unwrap(), "slow body\n");

        // The second store picks the log up without downloading it again
        let lease = second.acquire(JobId(1), "u").await.unwrap();
        assert_eq!(fs::read_to_string(lease.path()).unwrap(), "slow body\n");
        assert_eq!(idle.calls(), 0);
    }

    #[tokio::test]
    async fn test_stores_sharing_root_keep_each_others_logs() {
        let dir = TempDir::new().unwrap();
        let first_fetcher = Arc::new(FakeFetcher::serving("first\n"));
        let second_fetcher = Arc::new(FakeFetcher::serving("second\n"));
        let first = open(&dir, 1 << 20, &first_fetcher);
        let second = open(&dir, 1 << 20, &second_fetcher);

        drop(first.acquire(JobId(1), "u1").await.unwrap());
        drop(second.acquire(JobId(2), "u2").await.unwrap());
        first.flush().unwrap();
        second.flush().unwrap();

        let idle = Arc::new(FakeFetcher::serving(""));
        let third = open(&dir, 1 << 20, &idle);
        assert!(third.contains(JobId(1)));
        assert!(third.contains(JobId(2)));
        assert_eq!(third.total_bytes(), 13);
        assert_eq!(third.acquire(JobId(2), "u2").await.unwrap().source_url, "u2");
        assert_eq!(idle.calls(), 0);
    }

    #[tokio::test]
    async fn test_budget_counts_logs_cached_by_other_stores() {
        let dir = TempDir::new().unwrap();
        let first_fetcher = Arc::new(FakeFetcher::serving("12345\n"));
        let second_fetcher = Arc::new(FakeFetcher::serving("123456\n"));
        let first = open(&dir, 10, &first_fetcher);
        let second = open(&dir, 10, &second_fetcher);

        drop(first.acquire(JobId(1), "u").await.unwrap());
        drop(second.acquire(JobId(2), "u").await.unwrap());
        assert!(!dir.path().join(log_file_name(JobId(1))).exists());
        assert!(!second.contains(JobId(1)));
        assert_eq!(second.total_bytes(), 7);
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy {
            attempts: 4,
            backoff_base: Duration::from_millis(100),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let dir = TempDir::new().unwrap();
        let fetcher: Arc<dyn LogFetcher> = Arc::new(FakeFetcher::serving(""));
        assert!(matches!(
            LogStore::open(StoreConfig::new(dir.path(), 0), fetcher),
            Err(StoreError::Config(_))
        ));
    }
}
