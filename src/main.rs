mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use logsift_logs::{
    AnalysisError, ExtractOptions, LineScanner, LogSearch, ScanControl, SearchOptions,
    SectionQuery, TestParseOptions, extract, filter_section, parse_tests,
};
use logsift_store::{HttpFetcher, LogLease, LogStore, UrlTemplate, resolve_job};
use logsift_types::{HandleState, JobId};

use crate::config::{Config, load_config};

/// logsift - bounded, streaming analysis of large CI job logs
#[derive(Parser, Debug)]
#[command(name = "logsift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ./logsift.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Raise log verbosity on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Give up after this many seconds, returning partial results
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Report scan progress on stderr
    #[arg(long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a job log and summarize it
    Fetch {
        /// Job id or raw log URL
        job: String,
    },

    /// Classify error lines into categories, with context
    Extract {
        /// Job id or raw log URL
        job: String,

        /// Restrict to these categories (repeatable)
        #[arg(long = "category", value_name = "NAME")]
        categories: Vec<String>,

        #[arg(long, value_name = "N")]
        max_matches: Option<usize>,

        /// Lines of context around each match
        #[arg(long, value_name = "N")]
        context: Option<usize>,
    },

    /// Parse per-test outcomes from test runner output
    Tests {
        /// Job id or raw log URL
        job: String,

        /// gotest, pytest, unittest or simple (probed when omitted)
        #[arg(long)]
        dialect: Option<String>,

        #[arg(long, value_name = "N")]
        max_outcomes: Option<usize>,
    },

    /// Return a range of lines between markers or from an offset
    Section {
        /// Job id or raw log URL
        job: String,

        /// Regex of the first line (inclusive)
        #[arg(long, value_name = "PATTERN")]
        start: Option<String>,

        /// Regex of the line after the section (exclusive)
        #[arg(long, value_name = "PATTERN")]
        stop: Option<String>,

        /// 1-based line to start at (or to start looking for --start)
        #[arg(long, value_name = "N")]
        from_line: Option<u64>,

        #[arg(long, value_name = "N", default_value = "100")]
        max_lines: usize,
    },

    /// Search many job logs for a pattern, newest job first
    Search {
        /// Regex to search for
        pattern: String,

        /// Job ids, newest first
        #[arg(required = true, value_name = "JOB")]
        jobs: Vec<u64>,

        #[arg(long, value_name = "N")]
        per_log: Option<usize>,

        #[arg(long, value_name = "N")]
        total: Option<usize>,

        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Delete cached logs fetched more than SECS seconds ago
    Purge {
        #[arg(long, value_name = "SECS")]
        older_than: u64,
    },

    /// Mark a cached log as the first to evict
    Release {
        job: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `fetch` response
#[derive(Serialize)]
struct FetchSummary {
    job_id: JobId,
    source_url: String,
    local_path: PathBuf,
    size_bytes: u64,
    line_count: u64,
    fetched_at: DateTime<Utc>,
}

/// A per-job result tagged with its job
#[derive(Serialize)]
struct JobResponse<T: Serialize> {
    job_id: JobId,
    #[serde(flatten)]
    result: T,
    /// `--from-line` for the next page of a truncated section
    #[serde(skip_serializing_if = "Option::is_none")]
    next_line: Option<u64>,
}

impl<T: Serialize> JobResponse<T> {
    fn new(job_id: JobId, result: T) -> Self {
        Self {
            job_id,
            result,
            next_line: None,
        }
    }
}

#[derive(Serialize)]
struct ReleaseSummary {
    job_id: JobId,
    state: HandleState,
}

/// Store, locator and per-invocation limits shared by all commands
struct Engine {
    config: Config,
    store: LogStore,
    locator: Arc<UrlTemplate>,
    deadline: Option<Instant>,
    progress: bool,
    /// Fired by Ctrl-C
    cancel: CancellationToken,
}

impl Engine {
    fn open(config: Config, timeout: Option<u64>, progress: bool) -> Result<Self> {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.fetch.timeout_secs))?;
        let store = LogStore::open(config.store_config(), Arc::new(fetcher))
            .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))?;
        let locator = Arc::new(config.url_template()?);
        let deadline = timeout.and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));

        // Ctrl-C ends scans early with partial results
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });

        Ok(Self {
            config,
            store,
            locator,
            deadline,
            progress,
            cancel,
        })
    }

    async fn acquire(&self, job: &str) -> Result<LogLease> {
        let (job_id, url) = resolve_job(job, self.locator.as_ref())?;
        debug!("Acquiring job {} from {}", job_id, url);
        Ok(self.store.acquire_until(job_id, &url, self.deadline).await?)
    }

    fn control(&self, lease: &LogLease) -> ScanControl {
        let control = ScanControl::new()
            .with_deadline(self.deadline)
            .with_cancel(self.cancel.clone());
        if self.progress {
            control.with_progress(output::stderr_progress(format!("job {}", lease.job_id)))
        } else {
            control
        }
    }

    fn emit<T: Serialize>(&self, value: &T) -> Result<()> {
        output::emit(value, self.config.output.max_response_bytes)
    }
}

/// Run `pass` over a leased log on the blocking pool. The lease pins the log
/// until the pass finishes.
async fn scan<T, F>(lease: LogLease, pass: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&LineScanner) -> Result<T, AnalysisError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<T> {
        let scanner = LineScanner::open(lease.path())
            .with_context(|| format!("Failed to open {}", lease.path().display()))?;
        let result = pass(&scanner)?;
        drop(lease);
        Ok(result)
    })
    .await
    .context("Scan task failed")?
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let engine = Engine::open(config, args.timeout, args.progress)?;

    match args.command {
        Command::Fetch { job } => {
            let lease = engine.acquire(&job).await?;
            let handle = lease.handle().clone();
            let line_count = scan(lease, |scanner| Ok(scanner.count_lines()?)).await?;
            engine.emit(&FetchSummary {
                job_id: handle.job_id,
                source_url: handle.source_url,
                local_path: handle.local_path.unwrap_or_default(),
                size_bytes: handle.size_bytes,
                line_count,
                fetched_at: handle.fetched_at,
            })?;
        }

        Command::Extract {
            job,
            categories,
            max_matches,
            context,
        } => {
            let mut set = engine.config.categories()?;
            if !categories.is_empty() {
                set = set.select(&categories)?;
            }
            let options = ExtractOptions {
                max_total_matches: max_matches.unwrap_or(engine.config.extract.max_total_matches),
                context_lines: context.unwrap_or(engine.config.extract.context_lines),
                max_line_chars: engine.config.extract.max_line_chars,
            };
            let lease = engine.acquire(&job).await?;
            let job_id = lease.job_id;
            let control = engine.control(&lease);
            let extraction = scan(lease, move |scanner| extract(scanner, &set, &options, &control)).await?;
            engine.emit(&JobResponse::new(job_id, extraction))?;
        }

        Command::Tests {
            job,
            dialect,
            max_outcomes,
        } => {
            let tests = &engine.config.tests;
            let options = TestParseOptions {
                dialect,
                max_outcomes: max_outcomes.unwrap_or(tests.max_outcomes),
                max_message_chars: tests.max_message_chars,
                probe_lines: tests.probe_lines,
                min_probe_matches: tests.min_probe_matches,
                ..Default::default()
            };
            let lease = engine.acquire(&job).await?;
            let job_id = lease.job_id;
            let control = engine.control(&lease);
            let report = scan(lease, move |scanner| parse_tests(scanner, &options, &control)).await?;
            engine.emit(&JobResponse::new(job_id, report))?;
        }

        Command::Section {
            job,
            start,
            stop,
            from_line,
            max_lines,
        } => {
            let query = SectionQuery {
                start_pattern: start,
                stop_pattern: stop,
                start_line: from_line,
                max_lines,
                ..Default::default()
            };
            let lease = engine.acquire(&job).await?;
            let job_id = lease.job_id;
            let control = engine.control(&lease);
            let slice = scan(lease, move |scanner| filter_section(scanner, &query, &control)).await?;
            let next_line = slice.next_line();
            engine.emit(&JobResponse {
                job_id,
                result: slice,
                next_line,
            })?;
        }

        Command::Search {
            pattern,
            jobs,
            per_log,
            total,
            workers,
        } => {
            let search_config = &engine.config.search;
            let options = SearchOptions {
                per_log_limit: per_log.unwrap_or(search_config.per_log_limit),
                total_limit: total.unwrap_or(search_config.total_limit),
                workers: workers.unwrap_or(search_config.workers).max(1),
                max_line_chars: engine.config.extract.max_line_chars,
                weights: engine.config.ranking_weights(),
                deadline: engine.deadline,
            };
            let job_ids: Vec<JobId> = jobs.into_iter().map(JobId).collect();

            // Cancelling stops dispatching; running jobs finish
            let search = LogSearch::new(engine.store.clone(), engine.locator.clone());
            let results = search
                .search(&pattern, &job_ids, &options, engine.cancel.clone())
                .await?;
            engine.emit(&results)?;
        }

        Command::Purge { older_than } => {
            let report = engine.store.purge(Duration::from_secs(older_than))?;
            engine.emit(&report)?;
        }

        Command::Release { job } => {
            let job_id = JobId(job);
            engine.store.release(job_id)?;
            engine.emit(&ReleaseSummary {
                job_id,
                state: engine.store.state(job_id),
            })?;
        }
    }

    engine.store.flush()?;
    Ok(())
}
