//! Streaming analysis of CI job logs
//!
//! Every pass reads a log through [`LineScanner`] one line at a time and
//! returns a bounded result with an explicit `truncated` flag:
//!
//! - [`extract`]: classify lines into match categories with context
//! - [`parse_tests`]: recover per-test outcomes from runner output
//! - [`filter_section`]: slice a marker-delimited or offset range
//! - [`LogSearch`]: rank matches for one pattern across many logs

mod buffer;
mod categories;
mod control;
mod dialect;
mod error;
mod extract;
mod scanner;
mod search;
mod section;
mod test_results;
mod text;

pub use categories::{CategorySet, MatchCategory, default_categories};
pub use control::{ProgressFn, ScanControl};
pub use dialect::{Dialect, builtin_dialects, detect_dialect, dialect_by_name};
pub use error::AnalysisError;
pub use extract::{ExtractOptions, extract};
pub use scanner::{LineScanner, ScannedLine};
pub use search::{LogSearch, RankingWeights, SearchOptions};
pub use section::{SectionQuery, filter_section};
pub use test_results::{TestParseOptions, parse_summary, parse_tests};
pub use text::{floor_char_boundary, strip_timestamp};
