//! Streaming line access to log files
//!
//! Files are read through a fixed-size buffer and split on `\n`; a line that
//! spans buffer refills is carried over, so memory use is bounded by the
//! chunk size plus [`MAX_LINE_BYTES`], never by the file size.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Read buffer size
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes of a single line kept in memory; the rest of the line is skipped
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A decoded line and its 1-based position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedLine {
    pub number: u64,
    pub text: String,
}

/// Entry point for reading an immutable log file
#[derive(Clone, Debug)]
pub struct LineScanner {
    path: PathBuf,
    size_bytes: u64,
}

impl LineScanner {
    /// Open a log file for scanning
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self { path, size_bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Start a fresh pass from the first line
    pub fn lines(&self) -> io::Result<Lines> {
        let file = File::open(&self.path)?;
        Ok(Lines {
            reader: BufReader::with_capacity(CHUNK_SIZE, file),
            buf: Vec::new(),
            line_number: 0,
            bytes_read: 0,
        })
    }

    /// Up to `max_lines` lines starting at `start_line` (1-based)
    pub fn seek_window(&self, start_line: u64, max_lines: usize) -> io::Result<Vec<ScannedLine>> {
        let mut lines = self.lines()?;
        lines.skip_lines(start_line.saturating_sub(1))?;
        lines.take(max_lines).collect()
    }

    /// Count lines without decoding them
    pub fn count_lines(&self) -> io::Result<u64> {
        let mut lines = self.lines()?;
        lines.skip_lines(u64::MAX)
    }
}

/// Lazy, finite sequence of lines from one pass over a file
pub struct Lines {
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_number: u64,
    bytes_read: u64,
}

impl Lines {
    /// Number of the last line produced or skipped
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Bytes consumed from the file so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Advance past `n` lines without decoding them. Returns how many were
    /// skipped, which is less than `n` only at end of file.
    pub fn skip_lines(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0;
        let mut in_line = false;
        while skipped < n {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                // Unterminated final line
                if in_line {
                    skipped += 1;
                    self.line_number += 1;
                }
                break;
            }
            let taken = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    skipped += 1;
                    self.line_number += 1;
                    in_line = false;
                    pos + 1
                }
                None => {
                    in_line = true;
                    available.len()
                }
            };
            self.reader.consume(taken);
            self.bytes_read += taken as u64;
        }
        Ok(skipped)
    }

    /// Read the next raw line into `buf`. Returns false at end of file.
    fn read_raw(&mut self) -> io::Result<bool> {
        self.buf.clear();
        let mut saw_bytes = false;
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(saw_bytes);
            }
            saw_bytes = true;
            let (taken, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            let content = if complete {
                &available[..taken - 1]
            } else {
                &available[..taken]
            };
            let room = MAX_LINE_BYTES.saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&content[..content.len().min(room)]);
            self.reader.consume(taken);
            self.bytes_read += taken as u64;
            if complete {
                return Ok(true);
            }
        }
    }
}

impl Iterator for Lines {
    type Item = io::Result<ScannedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_raw() {
            Ok(true) => {
                self.line_number += 1;
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                // Binary or mis-encoded bytes decode to U+FFFD instead of failing
                let text = String::from_utf8_lossy(&self.buf).into_owned();
                Some(Ok(ScannedLine {
                    number: self.line_number,
                    text,
                }))
            }
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn log_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn texts(scanner: &LineScanner) -> Vec<String> {
        scanner
            .lines()
            .unwrap()
            .map(|l| l.unwrap().text)
            .collect()
    }

    #[test]
    fn test_lines_are_numbered_from_one() {
        let file = log_file(b"first\nsecond\r\nthird");
        let scanner = LineScanner::open(file.path()).unwrap();
        let lines: Vec<_> = scanner.lines().unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].number, 1);
        assert_eq!(lines[1].text, "second");
        assert_eq!(lines[2].number, 3);
        assert_eq!(lines[2].text, "third");
    }

    #[test]
    fn test_empty_file_has_no_lines() {
        let file = log_file(b"");
        let scanner = LineScanner::open(file.path()).unwrap();
        assert!(texts(&scanner).is_empty());
        assert_eq!(scanner.count_lines().unwrap(), 0);
    }

    #[test]
    fn test_lines_spanning_chunks() {
        let long = "y".repeat(CHUNK_SIZE * 2 + 17);
        let content = format!("a\n{}\nb\n", long);
        let file = log_file(content.as_bytes());
        let scanner = LineScanner::open(file.path()).unwrap();
        let lines = texts(&scanner);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].len(), MAX_LINE_BYTES);
        assert_eq!(lines[2], "b");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let file = log_file(b"ok\n\xff\xfe broken\nend\n");
        let scanner = LineScanner::open(file.path()).unwrap();
        let lines = texts(&scanner);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains('\u{FFFD}'));
        assert!(lines[1].ends_with("broken"));
    }

    #[test]
    fn test_restartable() {
        let file = log_file(b"one\ntwo\n");
        let scanner = LineScanner::open(file.path()).unwrap();
        assert_eq!(texts(&scanner), texts(&scanner));
    }

    #[test]
    fn test_seek_window() {
        let content: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
        let file = log_file(content.as_bytes());
        let scanner = LineScanner::open(file.path()).unwrap();

        let window = scanner.seek_window(40, 3).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].number, 40);
        assert_eq!(window[0].text, "line 40");
        assert_eq!(window[2].text, "line 42");

        let tail = scanner.seek_window(99, 10).unwrap();
        assert_eq!(tail.len(), 2);

        assert!(scanner.seek_window(500, 10).unwrap().is_empty());
        assert_eq!(scanner.count_lines().unwrap(), 100);
    }

    #[test]
    fn test_count_unterminated_last_line() {
        let file = log_file(b"a\nb\nc");
        let scanner = LineScanner::open(file.path()).unwrap();
        assert_eq!(scanner.count_lines().unwrap(), 3);
    }
}
