//! Fan-out search across many job logs
//!
//! Each job is acquired through the store and scanned on the blocking pool,
//! with at most `workers` jobs in flight. Hits are buffered and ranked once
//! every job has finished, so the order never depends on which download
//! completed first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use logsift_store::{LogLocator, LogStore};
use logsift_types::{JobId, SearchHit, SearchResults, SkippedJob};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ScanControl;
use crate::error::AnalysisError;
use crate::scanner::LineScanner;
use crate::text::{excerpt, strip_timestamp};

/// Relative weight of the two ranking signals
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankingWeights {
    /// Favours jobs earlier in the input (newer commits)
    pub recency: f64,
    /// Favours logs with few, distinctive matches
    pub density: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            recency: 0.5,
            density: 0.5,
        }
    }
}

impl RankingWeights {
    /// Score of a hit from the job at `rank` of `jobs`, in a log with
    /// `total_matches` matching lines of which `repeats` share its text
    pub fn score(&self, rank: usize, jobs: usize, total_matches: u64, repeats: u32) -> f64 {
        let recency = if jobs <= 1 {
            1.0
        } else {
            1.0 - rank as f64 / (jobs - 1) as f64
        };
        let spread = 1.0 + (total_matches.max(1) as f64).ln();
        let density = 1.0 / (spread * repeats.max(1) as f64);
        self.recency * recency + self.density * density
    }
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub per_log_limit: usize,
    pub total_limit: usize,
    /// Jobs acquired and scanned concurrently
    pub workers: usize,
    pub max_line_chars: usize,
    pub weights: RankingWeights,
    pub deadline: Option<Instant>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            per_log_limit: 20,
            total_limit: 100,
            workers: 8,
            max_line_chars: 300,
            weights: RankingWeights::default(),
            deadline: None,
        }
    }
}

/// Matches kept from one log
#[derive(Debug, Default)]
struct LogScan {
    hits: Vec<(u64, String)>,
    /// Lines sharing each kept hit's text, by position in `hits`
    repeats: Vec<u32>,
    total_matches: u64,
    truncated: bool,
}

/// Scan one log for `pattern`, keeping the first `limit` matching lines
fn scan_log(
    path: &Path,
    pattern: &Regex,
    limit: usize,
    max_line_chars: usize,
    control: &ScanControl,
) -> Result<LogScan, AnalysisError> {
    let scanner = LineScanner::open(path)?;
    let mut lines = scanner.lines()?;
    let mut ticker = control.ticker(scanner.size_bytes());
    let mut scan = LogScan::default();
    // Occurrences of each kept hit's text
    let mut occurrences: HashMap<String, u32> = HashMap::new();
    let mut kept_texts: Vec<String> = Vec::new();

    while let Some(line) = lines.next() {
        let line = line?;
        let body = strip_timestamp(&line.text).trim_end();
        if let Some(found) = pattern.find(body) {
            scan.total_matches += 1;
            let keep = scan.hits.len() < limit;
            match occurrences.get_mut(body) {
                Some(count) => *count += 1,
                None if keep => {
                    occurrences.insert(body.to_string(), 1);
                }
                None => {}
            }
            if keep {
                scan.hits
                    .push((line.number, excerpt(body, found.range(), max_line_chars)));
                kept_texts.push(body.to_string());
            } else {
                scan.truncated = true;
            }
        }
        if !ticker.tick(lines.bytes_read()) {
            scan.truncated = true;
            break;
        }
    }

    scan.repeats = kept_texts
        .iter()
        .map(|text| occurrences.get(text).copied().unwrap_or(1))
        .collect();
    ticker.finish(lines.bytes_read());
    Ok(scan)
}

/// Searches job logs fetched through a [`LogStore`]
#[derive(Clone)]
pub struct LogSearch {
    store: LogStore,
    locator: Arc<dyn LogLocator>,
}

impl LogSearch {
    pub fn new(store: LogStore, locator: Arc<dyn LogLocator>) -> Self {
        Self { store, locator }
    }

    /// Search every job in `job_ids` (newest first) for `pattern`.
    ///
    /// A job that cannot be fetched or scanned is reported in `skipped`.
    /// Cancelling `cancel` stops new jobs from being dispatched; jobs
    /// already running finish normally.
    pub async fn search(
        &self,
        pattern: &str,
        job_ids: &[JobId],
        options: &SearchOptions,
        cancel: CancellationToken,
    ) -> Result<SearchResults, AnalysisError> {
        let regex = Regex::new(pattern)?;
        let jobs = job_ids.len();
        info!(
            "Searching {} logs for /{}/ with {} workers",
            jobs, pattern, options.workers
        );

        let finished: Vec<(usize, JobId, Result<LogScan, String>)> =
            stream::iter(job_ids.iter().copied().enumerate())
                .take_while(|_| {
                    let stop = cancel.is_cancelled()
                        || options.deadline.is_some_and(|d| Instant::now() >= d);
                    futures::future::ready(!stop)
                })
                .map(|(rank, job_id)| {
                    let regex = regex.clone();
                    async move { (rank, job_id, self.search_job(job_id, regex, options).await) }
                })
                .buffer_unordered(options.workers.max(1))
                .collect()
                .await;

        let mut results = SearchResults {
            cancelled: cancel.is_cancelled(),
            truncated: finished.len() < jobs,
            ..Default::default()
        };
        let mut ranked: Vec<(usize, SearchHit)> = Vec::new();
        let mut skipped: Vec<(usize, SkippedJob)> = Vec::new();

        for (rank, job_id, outcome) in finished {
            match outcome {
                Ok(scan) => {
                    results.searched += 1;
                    results.truncated |= scan.truncated;
                    for ((line_number, text), repeats) in scan.hits.into_iter().zip(scan.repeats) {
                        let score = options
                            .weights
                            .score(rank, jobs, scan.total_matches, repeats);
                        ranked.push((
                            rank,
                            SearchHit {
                                job_id,
                                line_number,
                                text,
                                score,
                            },
                        ));
                    }
                }
                Err(reason) => {
                    warn!("Skipping job {}: {}", job_id, reason);
                    skipped.push((rank, SkippedJob { job_id, reason }));
                }
            }
        }

        ranked.sort_by(|(rank_a, a), (rank_b, b)| {
            b.score
                .total_cmp(&a.score)
                .then(rank_a.cmp(rank_b))
                .then(a.line_number.cmp(&b.line_number))
        });
        if ranked.len() > options.total_limit {
            ranked.truncate(options.total_limit);
            results.truncated = true;
        }
        skipped.sort_by_key(|(rank, _)| *rank);

        results.hits = ranked.into_iter().map(|(_, hit)| hit).collect();
        results.skipped = skipped.into_iter().map(|(_, job)| job).collect();
        debug!(
            "Search finished: {} hits from {} logs, {} skipped",
            results.hits.len(),
            results.searched,
            results.skipped.len()
        );
        Ok(results)
    }

    async fn search_job(
        &self,
        job_id: JobId,
        regex: Regex,
        options: &SearchOptions,
    ) -> Result<LogScan, String> {
        let url = self.locator.locate(job_id);
        let lease = self
            .store
            .acquire_until(job_id, &url, options.deadline)
            .await
            .map_err(|e| e.to_string())?;

        let control = ScanControl::new().with_deadline(options.deadline);
        let limit = options.per_log_limit;
        let max_line_chars = options.max_line_chars;
        tokio::task::spawn_blocking(move || {
            let scan = scan_log(lease.path(), &regex, limit, max_line_chars, &control);
            drop(lease);
            scan
        })
        .await
        .map_err(|e| format!("scan task failed: {}", e))?
        .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logsift_store::{FetchFailure, LogFetcher, StoreConfig, UrlTemplate};
    use std::collections::HashMap as Map;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    /// Serves logs keyed by URL; unknown URLs fail as not found
    struct MapFetcher {
        logs: Map<String, String>,
        calls: AtomicUsize,
        delay: Duration,
        /// Cancelled as soon as the first download starts
        cancel_on_fetch: Option<CancellationToken>,
    }

    #[async_trait]
    impl LogFetcher for MapFetcher {
        async fn fetch(
            &self,
            url: &str,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_fetch {
                cancel.cancel();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let body = self.logs.get(url).ok_or(FetchFailure::NotFound(404))?;
            sink.write_all(body.as_bytes()).await.unwrap();
            Ok(body.len() as u64)
        }
    }

    fn locator() -> UrlTemplate {
        UrlTemplate::new("mem://{job_id}").unwrap()
    }

    fn map_fetcher(logs: &[(u64, &str)]) -> MapFetcher {
        let locator = locator();
        MapFetcher {
            logs: logs
                .iter()
                .map(|(id, body)| (locator.locate(JobId(*id)), body.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            cancel_on_fetch: None,
        }
    }

    fn setup(dir: &TempDir, logs: &[(u64, &str)]) -> (LogSearch, Arc<MapFetcher>) {
        setup_with(dir, map_fetcher(logs))
    }

    fn setup_with(dir: &TempDir, fetcher: MapFetcher) -> (LogSearch, Arc<MapFetcher>) {
        let fetcher = Arc::new(fetcher);
        let store = LogStore::open(
            StoreConfig::new(dir.path(), 1 << 20),
            Arc::clone(&fetcher) as Arc<dyn LogFetcher>,
        )
        .unwrap();
        (LogSearch::new(store, Arc::new(locator())), fetcher)
    }

    fn ids(ids: &[u64]) -> Vec<JobId> {
        ids.iter().copied().map(JobId).collect()
    }

    #[tokio::test]
    async fn test_failed_job_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (search, _) = setup(
            &dir,
            &[(1, "ok\nSegmentation fault\n"), (3, "Segmentation fault (core dumped)\n")],
        );

        let results = search
            .search(
                "Segmentation fault",
                &ids(&[1, 2, 3]),
                &SearchOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut hit_jobs: Vec<JobId> = results.hits.iter().map(|h| h.job_id).collect();
        hit_jobs.sort();
        assert_eq!(hit_jobs, ids(&[1, 3]));
        assert_eq!(results.skipped.len(), 1);
        assert_eq!(results.skipped[0].job_id, JobId(2));
        assert_eq!(results.searched, 2);
        assert!(!results.truncated);
    }

    #[tokio::test]
    async fn test_newer_jobs_rank_first() {
        let dir = TempDir::new().unwrap();
        let (search, _) = setup(&dir, &[(10, "boom\n"), (20, "boom\n"), (30, "boom\n")]);

        let results = search
            .search("boom", &ids(&[30, 20, 10]), &SearchOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        let order: Vec<JobId> = results.hits.iter().map(|h| h.job_id).collect();
        assert_eq!(order, ids(&[30, 20, 10]));
    }

    #[tokio::test]
    async fn test_distinctive_matches_outrank_repeated_noise() {
        let dir = TempDir::new().unwrap();
        let noisy = "warning: deprecated\n".repeat(50);
        let (search, _) = setup(&dir, &[(1, noisy.as_str()), (2, "warning: disk almost full\n")]);
        let options = SearchOptions {
            weights: RankingWeights {
                recency: 0.0,
                density: 1.0,
            },
            ..Default::default()
        };

        let results = search
            .search("warning", &ids(&[1, 2]), &options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.hits[0].job_id, JobId(2));
        assert!(results.truncated);
    }

    #[tokio::test]
    async fn test_limits() {
        let dir = TempDir::new().unwrap();
        let body: String = (0..10).map(|i| format!("FAIL case {}\n", i)).collect();
        let (search, _) = setup(&dir, &[(1, body.as_str()), (2, body.as_str())]);
        let options = SearchOptions {
            per_log_limit: 3,
            total_limit: 5,
            ..Default::default()
        };

        let results = search
            .search("FAIL", &ids(&[1, 2]), &options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.hits.len(), 5);
        assert!(results.truncated);
        assert!(results.hits.iter().filter(|h| h.job_id == JobId(1)).count() <= 3);
        for pair in results.hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_cancelled_search_dispatches_nothing() {
        let dir = TempDir::new().unwrap();
        let (search, fetcher) = setup(&dir, &[(1, "x\n")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = search
            .search("x", &ids(&[1]), &SearchOptions::default(), cancel)
            .await
            .unwrap();
        assert!(results.cancelled);
        assert!(results.truncated);
        assert!(results.hits.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_search_keeps_running_jobs() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (search, fetcher) = setup_with(
            &dir,
            MapFetcher {
                delay: Duration::from_millis(50),
                cancel_on_fetch: Some(cancel.clone()),
                ..map_fetcher(&[(1, "panic: one\n"), (2, "panic: two\n"), (3, "panic: three\n")])
            },
        );
        let options = SearchOptions {
            workers: 1,
            ..Default::default()
        };

        let results = search
            .search("panic", &ids(&[1, 2, 3]), &options, cancel)
            .await
            .unwrap();
        assert!(results.cancelled);
        assert!(results.truncated);
        assert_eq!(results.searched, 1);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].job_id, JobId(1));
        assert_eq!(results.hits[0].text, "panic: one");
        assert!(results.skipped.is_empty());
        assert!(fetcher.calls.load(Ordering::SeqCst) < 3);
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_whole_search() {
        let dir = TempDir::new().unwrap();
        let (search, _) = setup(&dir, &[]);
        let result = search
            .search("[", &ids(&[1]), &SearchOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AnalysisError::InvalidPattern(_))));
    }

    #[test]
    fn test_scan_counts_repeats_ignoring_timestamps() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "2024-01-15T10:30:00.1234567Z error: disk full").unwrap();
        writeln!(file, "2024-01-15T10:30:01.1234567Z error: disk full").unwrap();
        writeln!(file, "error: bad input").unwrap();
        file.flush().unwrap();

        let pattern = Regex::new("error").unwrap();
        let scan = scan_log(file.path(), &pattern, 2, 100, &ScanControl::new()).unwrap();
        assert_eq!(scan.total_matches, 3);
        assert_eq!(scan.hits.len(), 2);
        assert_eq!(scan.hits[0], (1, "error: disk full".to_string()));
        assert_eq!(scan.repeats, vec![2, 2]);
        assert!(scan.truncated);
    }

    #[test]
    fn test_score_weights() {
        let weights = RankingWeights::default();
        assert!(weights.score(0, 3, 1, 1) > weights.score(2, 3, 1, 1));
        assert!(weights.score(0, 3, 1, 1) > weights.score(0, 3, 100, 1));
        assert_eq!(weights.score(0, 1, 1, 1), 1.0);
    }
}
