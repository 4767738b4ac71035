//! Shared types for logsift
//!
//! This crate contains the records produced by the log store and the
//! analysis passes. Every result container carries an explicit `truncated`
//! flag; callers never infer truncation from missing data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Cache Types
// ============================================================================

/// Identifier of a CI job. One job produces one log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle of a cached log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    #[default]
    Pending,
    Fetching,
    Ready,
    Failed,
}

/// A log file owned by the local store
#[derive(Clone, Debug, Serialize)]
pub struct LogHandle {
    pub job_id: JobId,
    pub source_url: String,
    pub local_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub state: HandleState,
}

impl LogHandle {
    pub fn is_ready(&self) -> bool {
        self.state == HandleState::Ready && self.local_path.is_some()
    }
}

// ============================================================================
// Extraction Types
// ============================================================================

/// A line claimed by a match category, with surrounding context
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtractedMatch {
    pub category: String,
    /// 1-based line number in the source log
    pub line_number: u64,
    pub text: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

/// Output of a pattern extraction pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct Extraction {
    /// Matches in source line order
    pub matches: Vec<ExtractedMatch>,
    /// Lines claimed per category, including those dropped by caps
    pub counts: BTreeMap<String, u64>,
    pub lines_scanned: u64,
    pub truncated: bool,
}

// ============================================================================
// Test Result Types
// ============================================================================

/// Outcome of a single test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    /// Parse the status word printed by common test runners
    pub fn from_marker(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pass" | "passed" | "ok" | "xpass" => Some(Self::Passed),
            "fail" | "failed" | "failure" | "unexpected success" => Some(Self::Failed),
            "skip" | "skipped" | "xfail" | "xfailed" | "expected failure" => Some(Self::Skipped),
            "error" | "errored" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Line where the outcome was recorded
    pub line_number: u64,
}

/// Counts over every outcome recorded in a log
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl TestCounts {
    pub fn record(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Error => self.errors += 1,
        }
    }

    /// Undo an earlier `record` (used when a placeholder outcome is replaced)
    pub fn retract(&mut self, status: TestStatus) {
        let slot = match status {
            TestStatus::Passed => &mut self.passed,
            TestStatus::Failed => &mut self.failed,
            TestStatus::Skipped => &mut self.skipped,
            TestStatus::Error => &mut self.errors,
        };
        *slot = slot.saturating_sub(1);
        self.total = self.total.saturating_sub(1);
    }
}

/// Totals printed by the test runner itself (pytest / unittest footers)
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunnerSummary {
    pub line_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Output of a test result parse
#[derive(Clone, Debug, Default, Serialize)]
pub struct TestReport {
    /// Dialect used, `None` when the log has no recognizable test output
    pub dialect: Option<String>,
    /// Outcomes in source order
    pub outcomes: Vec<TestOutcome>,
    pub counts: TestCounts,
    pub summaries: Vec<RunnerSummary>,
    pub truncated: bool,
}

// ============================================================================
// Section and Search Types
// ============================================================================

/// A contiguous run of lines from one log
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SectionSlice {
    /// First line returned, 0 when the slice is empty
    pub start_line: u64,
    /// Last line returned, 0 when the slice is empty
    pub end_line: u64,
    pub lines: Vec<String>,
    pub truncated: bool,
}

impl SectionSlice {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line to pass as `start_line` to fetch the next page
    pub fn next_line(&self) -> Option<u64> {
        self.truncated.then_some(self.end_line + 1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub job_id: JobId,
    pub line_number: u64,
    pub text: String,
    pub score: f64,
}

/// A job that could not be searched
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedJob {
    pub job_id: JobId,
    pub reason: String,
}

/// Output of a multi-log search
#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchResults {
    /// Hits ordered by descending score
    pub hits: Vec<SearchHit>,
    pub skipped: Vec<SkippedJob>,
    /// Jobs whose logs were scanned
    pub searched: usize,
    pub truncated: bool,
    pub cancelled: bool,
}
