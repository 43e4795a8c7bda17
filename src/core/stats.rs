//! Transfer statistics for both directions.
//!
//! [`speed`] and [`progress`] are pure functions of their inputs.
//! [`StatsTracker`] owns the clock and the monotone byte counter of one
//! transfer and hands out [`TransferStats`] snapshots.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Elapsed time below this is treated as this, so the first chunk of a
/// transfer never divides by zero.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second since the transfer started.
    pub speed: f64,
    /// Milliseconds since the UNIX epoch.
    pub start_time: u64,
    pub is_active: bool,
    pub direction: Direction,
    /// 0 to 100.
    pub progress: f64,
}

/// Average throughput in bytes per second.
pub fn speed(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.max(MIN_ELAPSED).as_secs_f64()
}

/// Percentage of `total` covered by `bytes`, clamped to 0..=100.
pub fn progress(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (bytes as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct StatsTracker {
    direction: Direction,
    total_bytes: u64,
    bytes: u64,
    start_time: u64,
    started: Instant,
    finished: bool,
}

impl StatsTracker {
    pub fn new(direction: Direction, total_bytes: u64) -> Self {
        Self {
            direction,
            total_bytes,
            bytes: 0,
            start_time: epoch_millis(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Record an absolute byte count. Lower values than already seen are
    /// ignored so `bytes_transferred` never goes backwards.
    pub fn update(&mut self, bytes: u64) -> TransferStats {
        self.bytes = self.bytes.max(bytes);
        self.snapshot()
    }

    /// Record `delta` more bytes.
    pub fn advance(&mut self, delta: u64) -> TransferStats {
        self.update(self.bytes.saturating_add(delta))
    }

    /// Mark the transfer done: inactive, progress 100.
    pub fn finish(&mut self) -> TransferStats {
        self.finished = true;
        self.snapshot()
    }

    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            bytes_transferred: self.bytes,
            total_bytes: self.total_bytes,
            speed: speed(self.bytes, self.started.elapsed()),
            start_time: self.start_time,
            is_active: !self.finished,
            direction: self.direction,
            progress: if self.finished {
                100.0
            } else {
                progress(self.bytes, self.total_bytes)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_uses_epsilon_for_zero_elapsed() {
        assert_eq!(speed(0, Duration::ZERO), 0.0);
        assert_eq!(speed(10, Duration::ZERO), 10_000.0);
        assert_eq!(speed(2048, Duration::from_secs(2)), 1024.0);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress(0, 0), 0.0);
        assert_eq!(progress(50, 200), 25.0);
        assert_eq!(progress(300, 200), 100.0);
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let mut t = StatsTracker::new(Direction::Receiving, 100);
        assert_eq!(t.update(40).bytes_transferred, 40);
        assert_eq!(t.update(10).bytes_transferred, 40);
        assert_eq!(t.advance(20).bytes_transferred, 60);

        let s = t.snapshot();
        assert!(s.is_active);
        assert_eq!(s.progress, 60.0);
        assert_eq!(s.direction, Direction::Receiving);
    }

    #[test]
    fn finish_reports_full_progress_even_for_empty_files() {
        let mut t = StatsTracker::new(Direction::Sending, 0);
        assert_eq!(t.snapshot().progress, 0.0);

        let done = t.finish();
        assert!(!done.is_active);
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.bytes_transferred, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_follows_the_clock() {
        let mut t = StatsTracker::new(Direction::Sending, 4096);
        tokio::time::advance(Duration::from_secs(2)).await;
        let s = t.update(4096);
        assert_eq!(s.speed, 2048.0);
        assert!(s.start_time > 0);
    }
}
