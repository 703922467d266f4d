//! Byte-level progress tracking for archive transfers.
//!
//! One tracker per in-flight transfer, shared between the uploading task and
//! observers (status queries, dashboards) via cheap clones.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A point-in-time snapshot of a transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to transfer
    pub total_bytes: u64,

    /// Bytes confirmed by the remote end so far
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Fraction complete (0.0 - 1.0)
    pub fraction: f64,
}

impl TransferProgress {
    fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            fraction: 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

struct TrackerState {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

/// Shareable progress tracker with time-based speed calculation.
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                start_time: now,
                last_update_time: now,
                last_bytes: 0,
                progress: TransferProgress::new(total_bytes),
            })),
        }
    }

    /// Record the new confirmed byte position and refresh the speed estimate.
    pub fn update(&self, transferred_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(state.last_bytes);
            state.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        state.progress.transferred_bytes = transferred_bytes;
        state.progress.fraction = if state.progress.total_bytes > 0 {
            transferred_bytes as f64 / state.progress.total_bytes as f64
        } else {
            0.0
        };
        state.last_update_time = now;
        state.last_bytes = transferred_bytes;
    }

    pub fn snapshot(&self) -> TransferProgress {
        self.state.lock().unwrap().progress.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().unwrap().start_time.elapsed()
    }

    /// Average speed since the transfer started.
    pub fn average_speed(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let elapsed = state.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (state.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
