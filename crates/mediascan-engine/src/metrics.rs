//! Throughput and timing metrics for progress events.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use mediascan_core::{ProgressMetrics, ScanPhase};

/// Window over which processing speed is measured.
pub const SPEED_WINDOW: Duration = Duration::from_secs(30);

/// Internal progress tracker with timing.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    phase: ScanPhase,
    phase_started: Instant,
    phase_started_at: DateTime<Utc>,
    /// `(when, processed files)` samples inside the speed window.
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_window(SPEED_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            phase: ScanPhase::Discovery,
            phase_started: now,
            phase_started_at: Utc::now(),
            samples: VecDeque::new(),
            window,
        }
    }

    /// Start timing a new phase; speed samples are reset.
    pub fn enter_phase(&mut self, phase: ScanPhase) {
        self.phase = phase;
        self.phase_started = Instant::now();
        self.phase_started_at = Utc::now();
        self.samples.clear();
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Record the processed-file count of the current phase.
    pub fn record(&mut self, processed: u64) {
        self.record_at(Instant::now(), processed);
    }

    fn record_at(&mut self, now: Instant, processed: u64) {
        self.samples.push_back((now, processed));
        while let Some(&(when, _)) = self.samples.front() {
            if now.duration_since(when) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Files per second over the window, if measurable.
    pub fn speed(&self) -> Option<f64> {
        let (first_at, first) = *self.samples.front()?;
        let (last_at, last) = *self.samples.back()?;
        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 || last <= first {
            return None;
        }
        Some((last - first) as f64 / elapsed)
    }

    /// Metrics for a progress event with `remaining` files left in the phase.
    pub fn metrics(&self, remaining: u64) -> ProgressMetrics {
        let speed = self.speed();
        ProgressMetrics {
            processing_speed: speed.map(|s| (s * 100.0).round() / 100.0),
            estimated_time_remaining: speed.map(|s| (remaining as f64 / s).ceil() as u64),
            phase_start_time: Some(self.phase_started_at),
            total_elapsed_time: Some(self.started.elapsed().as_secs()),
            current_phase_elapsed: Some(self.phase_started.elapsed().as_secs()),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_unknown_until_progress() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.speed().is_none());
        tracker.record(0);
        assert!(tracker.speed().is_none());

        let metrics = tracker.metrics(10);
        assert!(metrics.estimated_time_remaining.is_none());
        assert!(metrics.phase_start_time.is_some());
    }

    #[test]
    fn test_speed_over_window() {
        let mut tracker = ProgressTracker::with_window(Duration::from_secs(30));
        let t0 = Instant::now();
        tracker.record_at(t0, 0);
        tracker.record_at(t0 + Duration::from_secs(10), 50);
        tracker.record_at(t0 + Duration::from_secs(20), 100);

        assert_eq!(tracker.speed(), Some(5.0));
        let metrics = tracker.metrics(100);
        assert_eq!(metrics.estimated_time_remaining, Some(20));
    }

    #[test]
    fn test_old_samples_leave_the_window() {
        let mut tracker = ProgressTracker::with_window(Duration::from_secs(30));
        let t0 = Instant::now();
        tracker.record_at(t0, 0);
        tracker.record_at(t0 + Duration::from_secs(40), 10);
        tracker.record_at(t0 + Duration::from_secs(50), 110);

        // The first sample fell out of the window.
        assert_eq!(tracker.speed(), Some(10.0));
    }

    #[test]
    fn test_enter_phase_resets_samples() {
        let mut tracker = ProgressTracker::new();
        tracker.record(5);
        tracker.enter_phase(ScanPhase::Metadata);
        assert_eq!(tracker.phase(), ScanPhase::Metadata);
        assert!(tracker.speed().is_none());
    }
}
