//! Line text helpers shared by the analysis passes

use chrono::DateTime;
use std::ops::Range;

const ELLIPSIS: &str = "...";

/// Strip a leading RFC 3339 timestamp (as prefixed by hosted CI runners)
pub fn strip_timestamp(raw: &str) -> &str {
    // Runner format: 2024-01-15T10:30:00.1234567Z (28 chars)
    // Sometimes shorter: 2024-01-15T10:30:00Z (20 chars)
    if raw.len() >= 20 {
        // Use get() to safely handle UTF-8 multi-byte chars at boundaries
        let search_end = floor_char_boundary(raw, 36.min(raw.len()));
        if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
            if DateTime::parse_from_rfc3339(&raw[..=z_pos]).is_ok() {
                return raw[z_pos + 1..].trim_start();
            }
        }
    }
    raw
}

/// Find the largest valid char boundary <= the given byte index
pub fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Cut a line to at most `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}{}", &text[..end], ELLIPSIS),
        None => text.to_string(),
    }
}

/// Cut a line to `max_chars` characters while keeping `focus` (a byte range,
/// usually a regex match) visible
pub fn excerpt(text: &str, focus: Range<usize>, max_chars: usize) -> String {
    if text.chars().nth(max_chars).is_none() {
        return text.to_string();
    }
    // Leave a little lead-in before the match
    let lead = max_chars / 4;
    let focus_start = floor_char_boundary(text, focus.start);
    let chars_before = text[..focus_start].chars().count();
    if chars_before <= lead {
        return truncate_chars(text, max_chars);
    }
    let skip = chars_before - lead;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(focus_start);
    format!("{}{}", ELLIPSIS, truncate_chars(&text[start..], max_chars))
}
