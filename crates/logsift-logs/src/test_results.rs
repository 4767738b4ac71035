//! Reconstruction of per-test outcomes from raw runner output
//!
//! Each dialect drives the same small state machine:
//!
//! ```text
//! Idle --start--> InTest --outcome--> Recorded --start/outcome--> ...
//! ```
//!
//! Text seen while `InTest` becomes the diagnostic message of a failing
//! test; a failure keeps collecting a bounded number of trailing lines while
//! `Recorded`. A second start marker before the open test is recorded closes
//! it as `Error` with message [`UNTERMINATED`].

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

use logsift_types::{RunnerSummary, TestOutcome, TestReport, TestStatus};

use crate::control::ScanControl;
use crate::dialect::{Dialect, detect_dialect, dialect_by_name};
use crate::error::AnalysisError;
use crate::scanner::LineScanner;
use crate::text::strip_timestamp;

/// Message given to a test that never reported an outcome
pub const UNTERMINATED: &str = "unterminated";

const MAX_SUMMARIES: usize = 32;

static UNITTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Ran (?P<total>\d+) tests? in (?P<secs>\d+(?:\.\d+)?)s").expect("valid regex")
});

static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=+ (?P<body>.*?) in (?P<secs>\d+(?:\.\d+)?)s(?: \([^)]*\))? =+$")
        .expect("valid regex")
});

static PYTEST_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<n>\d+) (?P<kind>passed|failed|skipped|errors?|xfailed|xpassed)\b")
        .expect("valid regex")
});

/// Limits and hints for a test result parse
#[derive(Clone, Debug)]
pub struct TestParseOptions {
    /// Dialect name; probed from the log when `None`
    pub dialect: Option<String>,
    pub max_outcomes: usize,
    pub max_message_chars: usize,
    /// Lines collected after a failure marker
    pub max_trailing_lines: usize,
    /// Lines sampled when probing for a dialect
    pub probe_lines: usize,
    /// Start markers a dialect needs within the probe window
    pub min_probe_matches: usize,
}

impl Default for TestParseOptions {
    fn default() -> Self {
        Self {
            dialect: None,
            max_outcomes: 500,
            max_message_chars: 1000,
            max_trailing_lines: 20,
            probe_lines: 2000,
            min_probe_matches: 1,
        }
    }
}

/// Parse the test outcomes of one log.
///
/// A log without recognizable test output yields an empty report, not an
/// error.
pub fn parse_tests(
    scanner: &LineScanner,
    options: &TestParseOptions,
    control: &ScanControl,
) -> Result<TestReport, AnalysisError> {
    let dialect = match options.dialect.as_deref() {
        Some(name) => dialect_by_name(name)?,
        None => match probe_dialect(scanner, options)? {
            Some(dialect) => dialect,
            None => {
                debug!("No recognizable test output in {}", scanner.path().display());
                return Ok(TestReport::default());
            }
        },
    };
    debug!(
        "Parsing {} test results in {}",
        dialect.name(),
        scanner.path().display()
    );

    let mut machine = TestMachine::new(dialect, options);
    let mut lines = scanner.lines()?;
    let mut ticker = control.ticker(scanner.size_bytes());
    let mut last_line = 0;
    let mut complete = true;

    while let Some(line) = lines.next() {
        let line = line?;
        last_line = line.number;
        machine.feed(line.number, strip_timestamp(&line.text));
        if !ticker.tick(lines.bytes_read()) {
            complete = false;
            break;
        }
    }

    ticker.finish(lines.bytes_read());
    Ok(machine.finish(last_line, complete))
}

fn probe_dialect(
    scanner: &LineScanner,
    options: &TestParseOptions,
) -> Result<Option<&'static Dialect>, AnalysisError> {
    let sample = scanner
        .lines()?
        .take(options.probe_lines)
        .map(|line| line.map(|l| strip_timestamp(&l.text).to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(detect_dialect(&sample, options.min_probe_matches))
}

/// Parse a runner's own totals line (pytest footer or unittest `Ran N tests`)
pub fn parse_summary(line: &str, line_number: u64) -> Option<RunnerSummary> {
    if let Some(caps) = UNITTEST_SUMMARY.captures(line) {
        return Some(RunnerSummary {
            line_number,
            total: caps["total"].parse().ok(),
            duration_seconds: caps["secs"].parse().ok(),
            ..Default::default()
        });
    }

    let caps = PYTEST_SUMMARY.captures(line)?;
    let mut summary = RunnerSummary {
        line_number,
        duration_seconds: caps["secs"].parse().ok(),
        ..Default::default()
    };
    let mut counted = false;
    for count in PYTEST_COUNT.captures_iter(&caps["body"]) {
        let Ok(n) = count["n"].parse::<u64>() else {
            continue;
        };
        let slot = match &count["kind"] {
            "passed" | "xpassed" => &mut summary.passed,
            "failed" => &mut summary.failed,
            "skipped" | "xfailed" => &mut summary.skipped,
            _ => &mut summary.errors,
        };
        *slot = Some(slot.unwrap_or(0) + n);
        counted = true;
    }
    if !counted {
        return None;
    }
    summary.total = Some(
        [summary.passed, summary.failed, summary.skipped, summary.errors]
            .iter()
            .flatten()
            .sum(),
    );
    Some(summary)
}

/// Bounded accumulator for diagnostic text
struct Diagnostics {
    text: String,
    chars: usize,
    max_chars: usize,
    full: bool,
}

impl Diagnostics {
    fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
            full: false,
        }
    }

    fn push(&mut self, line: &str) {
        let line = line.trim();
        if self.full || is_noise(line) {
            return;
        }
        let sep = usize::from(!self.text.is_empty());
        let len = line.chars().count();
        if self.chars + sep + len > self.max_chars {
            let room = self.max_chars.saturating_sub(self.chars + sep);
            if room > 0 {
                if sep == 1 {
                    self.text.push('\n');
                }
                self.text.extend(line.chars().take(room));
            }
            self.text.push_str("...");
            self.full = true;
            return;
        }
        if sep == 1 {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.chars += sep + len;
    }

    fn into_message(self) -> Option<String> {
        (!self.text.is_empty()).then_some(self.text)
    }
}

/// Blank lines and separator rules carry no diagnostic value
fn is_noise(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.chars().all(|c| matches!(c, '-' | '=' | '_' | '~'))
}

/// Whether a detail header refers to a recorded outcome
fn names_match(outcome: &str, detail: &str) -> bool {
    outcome == detail || outcome.ends_with(&format!("::{}", detail.replace('.', "::")))
}

enum State {
    Idle,
    InTest {
        name: String,
        diagnostics: Diagnostics,
    },
    Recorded {
        target: Option<usize>,
        diagnostics: Diagnostics,
        lines_left: usize,
    },
}

struct TestMachine<'a> {
    dialect: &'a Dialect,
    options: &'a TestParseOptions,
    state: State,
    report: TestReport,
    /// Tests closed as unterminated, with their stored index (if within cap)
    unterminated: HashMap<String, Option<usize>>,
}

impl<'a> TestMachine<'a> {
    fn new(dialect: &'a Dialect, options: &'a TestParseOptions) -> Self {
        Self {
            dialect,
            options,
            state: State::Idle,
            report: TestReport {
                dialect: Some(dialect.name().to_string()),
                ..Default::default()
            },
            unterminated: HashMap::new(),
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.options.max_message_chars)
    }

    fn feed(&mut self, line_number: u64, line: &str) {
        if let Some(summary) = parse_summary(line, line_number) {
            self.settle();
            if self.report.summaries.len() < MAX_SUMMARIES {
                self.report.summaries.push(summary);
            } else {
                self.report.truncated = true;
            }
            return;
        }
        if let Some(name) = self.dialect.detail_marker(line) {
            self.on_detail(line_number, name);
            return;
        }
        if let Some(marker) = self.dialect.outcome_marker(line) {
            if let Some(status) = TestStatus::from_marker(marker.status) {
                self.on_outcome(line_number, marker.name, status, marker.duration_seconds);
                return;
            }
        }
        if let Some(name) = self.dialect.start_marker(line) {
            self.on_start(line_number, name);
            return;
        }
        self.on_text(line);
    }

    fn on_start(&mut self, line_number: u64, name: &str) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::InTest { name: open, .. } => {
                self.record(line_number, open, TestStatus::Error, None, Some(UNTERMINATED.to_string()));
            }
            State::Recorded {
                target,
                diagnostics,
                ..
            } => self.flush(target, diagnostics),
            State::Idle => {}
        }
        self.state = State::InTest {
            name: name.to_string(),
            diagnostics: self.diagnostics(),
        };
    }

    fn on_outcome(
        &mut self,
        line_number: u64,
        named: Option<&str>,
        status: TestStatus,
        duration: Option<f64>,
    ) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::InTest { name, diagnostics } => {
                if let Some(other) = named.filter(|n| *n != name) {
                    // Outcome for another test; the open one stays open
                    self.record(line_number, other.to_string(), status, duration, None);
                    self.state = State::InTest { name, diagnostics };
                    return;
                }
                self.close(line_number, name, status, duration, diagnostics);
            }
            State::Recorded {
                target,
                diagnostics,
                ..
            } => {
                self.flush(target, diagnostics);
                if let Some(name) = named {
                    let fresh = self.diagnostics();
                    self.close(line_number, name.to_string(), status, duration, fresh);
                }
            }
            State::Idle => {
                if let Some(name) = named {
                    let fresh = self.diagnostics();
                    self.close(line_number, name.to_string(), status, duration, fresh);
                }
            }
        }
    }

    fn on_detail(&mut self, line_number: u64, name: &str) {
        self.close_open(line_number);
        let target = self
            .report
            .outcomes
            .iter()
            .rposition(|o| o.status.is_failure() && o.message.is_none() && names_match(&o.name, name));
        self.state = State::Recorded {
            target,
            diagnostics: self.diagnostics(),
            lines_left: self.options.max_trailing_lines,
        };
    }

    fn on_text(&mut self, line: &str) {
        let exhausted = match &mut self.state {
            State::InTest { diagnostics, .. } => {
                diagnostics.push(line);
                false
            }
            State::Recorded {
                diagnostics,
                lines_left,
                ..
            } => {
                if *lines_left > 0 {
                    diagnostics.push(line);
                    *lines_left -= 1;
                }
                *lines_left == 0
            }
            State::Idle => false,
        };
        if exhausted {
            self.settle();
        }
    }

    /// Record an outcome for the open test and move to the next state
    fn close(
        &mut self,
        line_number: u64,
        name: String,
        status: TestStatus,
        duration: Option<f64>,
        diagnostics: Diagnostics,
    ) {
        let target = self.record(line_number, name, status, duration, None);
        match status {
            TestStatus::Passed => self.state = State::Idle,
            // Skip reasons come before the marker, never after
            TestStatus::Skipped => {
                self.flush(target, diagnostics);
                self.state = State::Idle;
            }
            TestStatus::Failed | TestStatus::Error => {
                self.state = State::Recorded {
                    target,
                    diagnostics,
                    lines_left: self.options.max_trailing_lines,
                };
            }
        }
    }

    /// Close whatever is open: pending tests become unterminated
    fn close_open(&mut self, line_number: u64) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::InTest { name, .. } => {
                self.record(line_number, name, TestStatus::Error, None, Some(UNTERMINATED.to_string()));
            }
            State::Recorded {
                target,
                diagnostics,
                ..
            } => self.flush(target, diagnostics),
            State::Idle => {}
        }
    }

    /// Finish trailing-diagnostic collection, leaving an open test alone
    fn settle(&mut self) {
        if matches!(self.state, State::Recorded { .. }) {
            if let State::Recorded {
                target,
                diagnostics,
                ..
            } = std::mem::replace(&mut self.state, State::Idle)
            {
                self.flush(target, diagnostics);
            }
        }
    }

    fn flush(&mut self, target: Option<usize>, diagnostics: Diagnostics) {
        let (Some(index), Some(message)) = (target, diagnostics.into_message()) else {
            return;
        };
        if let Some(outcome) = self.report.outcomes.get_mut(index) {
            outcome.message = Some(match outcome.message.take() {
                Some(existing) => format!("{}\n{}", existing, message),
                None => message,
            });
        }
    }

    fn record(
        &mut self,
        line_number: u64,
        name: String,
        status: TestStatus,
        duration_seconds: Option<f64>,
        message: Option<String>,
    ) -> Option<usize> {
        // A late outcome supersedes the placeholder of an unterminated test
        // (nested go subtests report their parent last)
        if message.is_none() {
            if let Some(slot) = self.unterminated.remove(&name) {
                self.report.counts.retract(TestStatus::Error);
                self.report.counts.record(status);
                let index = slot?;
                let outcome = &mut self.report.outcomes[index];
                outcome.status = status;
                outcome.duration_seconds = duration_seconds;
                outcome.message = None;
                outcome.line_number = line_number;
                return Some(index);
            }
        }

        self.report.counts.record(status);
        let unterminated = message.as_deref() == Some(UNTERMINATED);
        if self.report.outcomes.len() >= self.options.max_outcomes {
            self.report.truncated = true;
            if unterminated {
                self.unterminated.insert(name, None);
            }
            return None;
        }
        let index = self.report.outcomes.len();
        if unterminated {
            self.unterminated.insert(name.clone(), Some(index));
        }
        self.report.outcomes.push(TestOutcome {
            name,
            status,
            duration_seconds,
            message,
            line_number,
        });
        Some(index)
    }

    fn finish(mut self, last_line: u64, complete: bool) -> TestReport {
        if complete {
            self.close_open(last_line);
        } else {
            self.settle();
            self.report.truncated = true;
        }
        self.report
    }
}
