use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractProgress {
    pub item_index: Option<u64>,
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: ExtractProgress);
}

#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _progress: ExtractProgress) {}
}

/// Logs aggregate progress at most once per interval.
#[derive(Debug)]
pub struct ThrottledProgressLog {
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl Default for ThrottledProgressLog {
    fn default() -> Self {
        Self::new(PROGRESS_REPORT_INTERVAL)
    }
}

impl ThrottledProgressLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Mutex::new(None),
        }
    }

    fn should_report(&self, now: Instant) -> bool {
        let mut last = self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(prev) if now.duration_since(prev) <= self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl ProgressSink for ThrottledProgressLog {
    fn on_progress(&self, progress: ExtractProgress) {
        if !self.should_report(Instant::now()) {
            return;
        }
        let percent = if progress.total_bytes == 0 {
            100.0
        } else {
            progress.completed_bytes as f64 / progress.total_bytes as f64 * 100.0
        };
        info!(
            event = "extract.progress",
            completed_bytes = progress.completed_bytes,
            total_bytes = progress.total_bytes,
            "Total progress: {} / {} {percent:.2}%",
            format_bytes_iec(progress.completed_bytes),
            format_bytes_iec(progress.total_bytes),
        );
    }
}

pub fn format_bytes_iec(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.2} {prefix}iB", bytes as f64 / div as f64)
}
