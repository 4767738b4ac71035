//! Test runner dialects
//!
//! A dialect is a start marker naming a test, one or more outcome markers
//! carrying a status word (and optionally the name and a duration in
//! seconds), and an optional detail header that introduces diagnostics for a
//! test reported earlier.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::AnalysisError;

/// Built-in dialects as `(name, start, outcomes, detail)`, in probe order
const BUILTIN: &[(&str, &str, &[&str], Option<&str>)] = &[
    (
        "gotest",
        r"^\s*=== RUN\s+(?P<name>\S+)",
        &[r"^\s*--- (?P<status>PASS|FAIL|SKIP): (?P<name>\S+)(?: \((?P<duration>\d+(?:\.\d+)?)s\))?"],
        None,
    ),
    (
        "pytest",
        // pytest-xdist prefixes results with the worker, progress and status
        r"^(?:\[gw\d+\] (?:\[\s*\d+%\] )?(?:PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS) )?(?P<name>\S+\.py::\S+)",
        &[
            r"^(?P<name>\S+\.py::\S+)\s+(?P<status>PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS)\b",
            r"^\[gw\d+\] (?:\[\s*\d+%\] )?(?P<status>PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS) (?P<name>\S+\.py::\S+)",
        ],
        Some(r"^_{3,} (?:\[gw\d+\] )?(?P<name>\S+) _{3,}$"),
    ),
    (
        "unittest",
        r"^(?P<name>test\w* \([\w.]+\))",
        &[r"^(?:(?P<name>test\w* \([\w.]+\)).*?\.\.\. )?(?P<status>ok|FAIL|ERROR|skipped|expected failure|unexpected success)(?: .*)?$"],
        Some(r"^(?:FAIL|ERROR): (?P<name>test\w* \([\w.]+\))"),
    ),
    (
        "simple",
        r"^\s*RUN\s+(?P<name>\S+)",
        &[r"^\s*(?P<status>PASS|FAIL|SKIP|ERROR)\s+(?P<name>\S+)(?:\s+\((?P<duration>\d+(?:\.\d+)?)s\))?"],
        None,
    ),
];

static DIALECTS: LazyLock<Vec<Dialect>> = LazyLock::new(|| {
    BUILTIN
        .iter()
        .map(|(name, start, outcomes, detail)| {
            Dialect::new(name, start, outcomes, *detail).expect("built-in dialect patterns are valid")
        })
        .collect()
});

/// Markers for one test runner's output format
#[derive(Debug)]
pub struct Dialect {
    name: String,
    start: Regex,
    outcomes: Vec<Regex>,
    detail: Option<Regex>,
}

/// A parsed outcome marker
#[derive(Debug, PartialEq)]
pub struct OutcomeMarker<'a> {
    pub name: Option<&'a str>,
    pub status: &'a str,
    pub duration_seconds: Option<f64>,
}

impl Dialect {
    pub fn new(
        name: &str,
        start: &str,
        outcomes: &[&str],
        detail: Option<&str>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            start: Regex::new(start)?,
            outcomes: outcomes
                .iter()
                .map(|pattern| Regex::new(pattern))
                .collect::<Result<_, _>>()?,
            detail: detail.map(Regex::new).transpose()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the test started on this line
    pub fn start_marker<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.start
            .captures(line)
            .and_then(|caps| caps.name("name"))
            .map(|m| m.as_str())
    }

    pub fn outcome_marker<'a>(&self, line: &'a str) -> Option<OutcomeMarker<'a>> {
        let caps = self.outcomes.iter().find_map(|re| re.captures(line))?;
        Some(OutcomeMarker {
            name: caps.name("name").map(|m| m.as_str()),
            status: caps.name("status")?.as_str(),
            duration_seconds: caps
                .name("duration")
                .and_then(|m| m.as_str().parse::<f64>().ok()),
        })
    }

    /// Name of the test whose diagnostics follow this line
    pub fn detail_marker<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.detail
            .as_ref()?
            .captures(line)
            .and_then(|caps| caps.name("name"))
            .map(|m| m.as_str())
    }

    /// Number of lines carrying this dialect's start marker
    pub fn probe<'a, I>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines
            .into_iter()
            .filter(|line| self.start.is_match(line))
            .count()
    }
}

/// All built-in dialects, in probe order
pub fn builtin_dialects() -> &'static [Dialect] {
    &DIALECTS
}

pub fn dialect_by_name(name: &str) -> Result<&'static Dialect, AnalysisError> {
    builtin_dialects()
        .iter()
        .find(|d| d.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| AnalysisError::UnknownDialect(name.to_string()))
}

/// First dialect whose start marker appears at least `min_matches` times
pub fn detect_dialect(lines: &[String], min_matches: usize) -> Option<&'static Dialect> {
    let min_matches = min_matches.max(1);
    builtin_dialects()
        .iter()
        .find(|d| d.probe(lines.iter().map(String::as_str)) >= min_matches)
}
