//! Deadlines, cancellation and progress reporting for long scans

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Lines between deadline/cancellation checks
const CHECK_INTERVAL_LINES: u32 = 1024;

/// Minimum time between progress callbacks
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Progress callback, invoked with `(completed_bytes, total_bytes)`
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Limits applied to a single scan
#[derive(Clone, Default)]
pub struct ScanControl {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    progress: Option<Arc<ProgressFn>>,
}

impl ScanControl {
    /// A control with no deadline, cancellation or progress reporting
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the scan should stop now
    pub fn should_stop(&self) -> bool {
        self.should_stop_at(Instant::now())
    }

    fn should_stop_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
            || self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Per-scan state for rate-limited checks over a file of `total_bytes`
    pub fn ticker(&self, total_bytes: u64) -> ScanTicker<'_> {
        ScanTicker {
            control: self,
            total_bytes,
            since_check: 0,
            last_progress: Instant::now(),
        }
    }
}

impl std::fmt::Debug for ScanControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanControl")
            .field("deadline", &self.deadline)
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Rate-limited view of a [`ScanControl`] for one pass
pub struct ScanTicker<'a> {
    control: &'a ScanControl,
    total_bytes: u64,
    since_check: u32,
    last_progress: Instant,
}

impl ScanTicker<'_> {
    /// Call once per line. Returns false when the scan must stop early.
    pub fn tick(&mut self, bytes_read: u64) -> bool {
        self.since_check += 1;
        if self.since_check < CHECK_INTERVAL_LINES {
            return true;
        }
        self.since_check = 0;

        let now = Instant::now();
        if let Some(progress) = &self.control.progress {
            if now.duration_since(self.last_progress) >= PROGRESS_INTERVAL {
                progress(bytes_read, self.total_bytes);
                self.last_progress = now;
            }
        }
        !self.control.should_stop_at(now)
    }

    /// Report final progress
    pub fn finish(&self, bytes_read: u64) {
        if let Some(progress) = &self.control.progress {
            progress(bytes_read, self.total_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_expired_deadline_stops_at_check() {
        let control = ScanControl::new().with_deadline(Some(Instant::now()));
        let mut ticker = control.ticker(100);
        let stopped = (0..CHECK_INTERVAL_LINES).any(|_| !ticker.tick(0));
        assert!(stopped);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancellationToken::new();
        let control = ScanControl::new().with_cancel(token.clone());
        assert!(!control.should_stop());
        token.cancel();
        assert!(control.should_stop());
    }

    #[test]
    fn test_finish_reports_progress() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let control = ScanControl::new().with_progress(move |done, total| {
            seen.lock().unwrap().push((done, total));
        });
        let ticker = control.ticker(42);
        ticker.finish(42);
        assert_eq!(calls.lock().unwrap().as_slice(), &[(42, 42)]);
    }
}
