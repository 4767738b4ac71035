//! Bounded slicing of a contiguous line range

use logsift_types::SectionSlice;
use regex::Regex;

use crate::control::ScanControl;
use crate::error::AnalysisError;
use crate::scanner::LineScanner;
use crate::text::{strip_timestamp, truncate_chars};

/// Where a section starts and stops
#[derive(Clone, Debug)]
pub struct SectionQuery {
    /// First line matching this pattern opens the section (inclusive)
    pub start_pattern: Option<String>,
    /// First later line matching this pattern closes it (exclusive)
    pub stop_pattern: Option<String>,
    /// 1-based line to begin at, or to begin the start search at
    pub start_line: Option<u64>,
    pub max_lines: usize,
    pub max_line_chars: usize,
}

impl Default for SectionQuery {
    fn default() -> Self {
        Self {
            start_pattern: None,
            stop_pattern: None,
            start_line: None,
            max_lines: 100,
            max_line_chars: 500,
        }
    }
}

impl SectionQuery {
    pub fn from_line(start_line: u64, max_lines: usize) -> Self {
        Self {
            start_line: Some(start_line),
            max_lines,
            ..Default::default()
        }
    }

    pub fn between(start: &str, stop: &str) -> Self {
        Self {
            start_pattern: Some(start.to_string()),
            stop_pattern: Some(stop.to_string()),
            ..Default::default()
        }
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, AnalysisError> {
    pattern.map(Regex::new).transpose().map_err(Into::into)
}

/// Slice the section described by `query` out of a log.
///
/// A start pattern that never matches yields an empty, untruncated slice.
/// `truncated` is set only when `max_lines` cut the section short or the
/// scan ran out of time.
pub fn filter_section(
    scanner: &LineScanner,
    query: &SectionQuery,
    control: &ScanControl,
) -> Result<SectionSlice, AnalysisError> {
    let start = compile(query.start_pattern.as_deref())?;
    let stop = compile(query.stop_pattern.as_deref())?;

    let mut lines = scanner.lines()?;
    let first = query.start_line.unwrap_or(1).max(1);
    if lines.skip_lines(first - 1)? < first - 1 {
        return Ok(SectionSlice::empty());
    }

    let mut ticker = control.ticker(scanner.size_bytes());
    let mut slice = SectionSlice::empty();
    let mut opened = start.is_none();

    while let Some(line) = lines.next() {
        let line = line?;
        let body = strip_timestamp(&line.text);

        if !opened {
            if start.as_ref().is_some_and(|re| re.is_match(body)) {
                opened = true;
                slice.start_line = line.number;
            } else {
                if !ticker.tick(lines.bytes_read()) {
                    slice.truncated = true;
                    break;
                }
                continue;
            }
        } else if stop.as_ref().is_some_and(|re| re.is_match(body)) {
            break;
        }

        if slice.lines.len() >= query.max_lines {
            slice.truncated = true;
            break;
        }
        if slice.lines.is_empty() {
            slice.start_line = line.number;
        }
        slice.lines.push(truncate_chars(&line.text, query.max_line_chars));
        slice.end_line = line.number;

        if !ticker.tick(lines.bytes_read()) {
            slice.truncated = true;
            break;
        }
    }

    ticker.finish(lines.bytes_read());
    if slice.lines.is_empty() {
        // The section was never found, or it was empty
        slice.start_line = 0;
        slice.end_line = 0;
    }
    Ok(slice)
}
