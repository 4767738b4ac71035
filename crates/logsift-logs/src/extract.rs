//! Single-pass classification of log lines into match categories

use logsift_types::{ExtractedMatch, Extraction};

use crate::buffer::LineRing;
use crate::categories::CategorySet;
use crate::control::ScanControl;
use crate::error::AnalysisError;
use crate::scanner::LineScanner;
use crate::text::{excerpt, strip_timestamp, truncate_chars};

/// Limits for a pattern extraction pass
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Matches returned across all categories
    pub max_total_matches: usize,
    /// Lines of context kept before and after each match
    pub context_lines: usize,
    /// Longer lines are cut (keeping the match visible)
    pub max_line_chars: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_total_matches: 200,
            context_lines: 3,
            max_line_chars: 300,
        }
    }
}

/// A match still collecting trailing context
struct OpenMatch {
    index: usize,
    remaining: usize,
}

/// Classify every line of a log against `categories`.
///
/// Each line is claimed by at most one category (the first in priority
/// order). Saturated categories keep counting but stop collecting; once
/// `max_total_matches` is exceeded the pass ends with `truncated` set.
pub fn extract(
    scanner: &LineScanner,
    categories: &CategorySet,
    options: &ExtractOptions,
    control: &ScanControl,
) -> Result<Extraction, AnalysisError> {
    let mut extraction = Extraction::default();
    let mut collected = vec![0usize; categories.len()];
    let mut before = LineRing::new(options.context_lines);
    let mut open: Vec<OpenMatch> = Vec::new();

    let mut lines = scanner.lines()?;
    let mut ticker = control.ticker(scanner.size_bytes());

    while let Some(line) = lines.next() {
        let line = line?;
        extraction.lines_scanned = line.number;
        let body = strip_timestamp(&line.text);
        let context_text = truncate_chars(body, options.max_line_chars);

        for pending in open.iter_mut() {
            extraction.matches[pending.index]
                .context_after
                .push(context_text.clone());
            pending.remaining -= 1;
        }
        open.retain(|m| m.remaining > 0);

        if let Some(idx) = categories.classify(body) {
            if let Some(category) = categories.get(idx) {
                *extraction
                    .counts
                    .entry(category.name().to_string())
                    .or_default() += 1;

                if collected[idx] >= category.max_matches()
                    || extraction.matches.len() >= options.max_total_matches
                {
                    extraction.truncated = true;
                } else {
                    collected[idx] += 1;
                    let text = match category.find(body) {
                        Some(range) => excerpt(body, range, options.max_line_chars),
                        None => context_text.clone(),
                    };
                    extraction.matches.push(ExtractedMatch {
                        category: category.name().to_string(),
                        line_number: line.number,
                        text,
                        context_before: before.to_vec(),
                        context_after: Vec::new(),
                    });
                    if options.context_lines > 0 {
                        open.push(OpenMatch {
                            index: extraction.matches.len() - 1,
                            remaining: options.context_lines,
                        });
                    }
                }
            }
        }

        before.push(context_text);

        // Budget spent and every window closed: nothing left to collect
        if extraction.truncated
            && open.is_empty()
            && extraction.matches.len() >= options.max_total_matches
        {
            break;
        }
        if !ticker.tick(lines.bytes_read()) {
            extraction.truncated = true;
            break;
        }
    }

    ticker.finish(lines.bytes_read());
    Ok(extraction)
}
