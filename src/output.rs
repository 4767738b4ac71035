//! Size-bounded JSON responses and stderr progress
//!
//! Results go to stdout as a single JSON document so callers can parse them;
//! progress and logs go to stderr. A response over the byte budget is shrunk
//! by dropping trailing array items (and then shortening long strings) until
//! it fits, and is marked `"truncated": true`.

use std::io::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use logsift_logs::floor_char_boundary;

/// Appended when a response has to be cut as raw text
pub const TRUNCATION_MARKER: &str = "\n<RESPONSE TRUNCATED>";

/// Strings are never shortened below this many bytes
const MIN_STRING_BYTES: usize = 64;

/// Serialize `value` to pretty JSON no longer than `max_bytes`
pub fn render<T: Serialize>(value: &T, max_bytes: usize) -> Result<String> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode response")?;
    if json.len() <= max_bytes {
        return Ok(json);
    }

    let mut value = serde_json::to_value(value).context("Failed to encode response")?;
    while shrink(&mut value) {
        if let Value::Object(map) = &mut value {
            map.insert("truncated".to_string(), Value::Bool(true));
        }
        let json = serde_json::to_string_pretty(&value).context("Failed to encode response")?;
        if json.len() <= max_bytes {
            return Ok(json);
        }
    }
    let json = serde_json::to_string_pretty(&value).context("Failed to encode response")?;
    Ok(bound(json, max_bytes))
}

/// Halve the longest array in `value`, or failing that its longest string.
/// Returns false once nothing is left to shorten.
fn shrink(value: &mut Value) -> bool {
    let mut longest = None;
    longest_array(value, String::new(), &mut longest);
    if let Some((_, pointer)) = longest {
        if let Some(Value::Array(items)) = value.pointer_mut(&pointer) {
            items.truncate(items.len() / 2);
            return true;
        }
    }

    let mut longest = None;
    longest_string(value, String::new(), &mut longest);
    if let Some((_, pointer)) = longest {
        if let Some(Value::String(text)) = value.pointer_mut(&pointer) {
            let keep = floor_char_boundary(text, (text.len() / 2).max(MIN_STRING_BYTES));
            text.truncate(keep);
            text.push_str("...");
            return true;
        }
    }
    false
}

fn child_pointer(parent: &str, key: &str) -> String {
    format!("{}/{}", parent, key.replace('~', "~0").replace('/', "~1"))
}

/// JSON pointer and length of the non-empty array with the most items
fn longest_array(value: &Value, pointer: String, best: &mut Option<(usize, String)>) {
    match value {
        Value::Array(items) => {
            if !items.is_empty() && best.as_ref().is_none_or(|(len, _)| items.len() > *len) {
                *best = Some((items.len(), pointer.clone()));
            }
            for (i, item) in items.iter().enumerate() {
                longest_array(item, child_pointer(&pointer, &i.to_string()), best);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                longest_array(item, child_pointer(&pointer, key), best);
            }
        }
        _ => {}
    }
}

/// JSON pointer and length of the longest string still worth shortening
fn longest_string(value: &Value, pointer: String, best: &mut Option<(usize, String)>) {
    match value {
        Value::String(text) => {
            // Room for the "..." suffix, so each pass gets shorter
            let shortenable = text.len() > MIN_STRING_BYTES + 3;
            if shortenable && best.as_ref().is_none_or(|(len, _)| text.len() > *len) {
                *best = Some((text.len(), pointer));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                longest_string(item, child_pointer(&pointer, &i.to_string()), best);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                longest_string(item, child_pointer(&pointer, key), best);
            }
        }
        _ => {}
    }
}

/// Cut `text` to `max_bytes`, marking the cut
pub fn bound(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let keep = floor_char_boundary(&text, max_bytes.saturating_sub(TRUNCATION_MARKER.len()));
    format!("{}{}", &text[..keep], TRUNCATION_MARKER)
}

/// Write a rendered response to stdout
pub fn emit<T: Serialize>(value: &T, max_bytes: usize) -> Result<()> {
    let rendered = render(value, max_bytes)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", rendered)?;
    stdout.flush()?;
    Ok(())
}

/// Progress callback printing "scan <label>  12.0 / 340.5 MiB" on stderr
pub fn stderr_progress(label: String) -> impl Fn(u64, u64) + Send + Sync + 'static {
    let started = Instant::now();
    move |done, total| {
        let line = format!(
            "scan {}  {} / {}  ({:.1}s)\n",
            label,
            format_mib(done),
            format_mib(total),
            started.elapsed().as_secs_f64()
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

fn format_mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}
