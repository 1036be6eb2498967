use crate::types::TimeSeriesPoint;
use chrono::Utc;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Iteration statistics for one scheduler interval. Reset after every
/// progress point so each point describes only its own window.
pub struct Statistics {
    pub total_iterations: u64,
    pub successful_iterations: u64,
    pub failed_iterations: u64,
    durations: Histogram<u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            total_iterations: 0,
            successful_iterations: 0,
            failed_iterations: 0,
            // Auto-resizing, microsecond resolution.
            durations: Histogram::<u64>::new(3)
                .expect("3 significant figures is a valid histogram precision"),
        }
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.total_iterations += 1;
        self.successful_iterations += 1;
        self.durations.saturating_record(duration.as_micros() as u64);
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.total_iterations += 1;
        self.failed_iterations += 1;
        self.durations.saturating_record(duration.as_micros() as u64);
    }

    /// Percentile of iteration duration in milliseconds.
    pub fn get_percentile(&self, percentile: f64) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        self.durations.value_at_percentile(percentile) as f64 / 1000.0
    }

    pub fn get_average(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        self.durations.mean() / 1000.0
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_iterations == 0 {
            0.0
        } else {
            (self.failed_iterations as f64 / self.total_iterations as f64) * 100.0
        }
    }

    /// Turns the window into a progress point and starts a new window.
    pub fn take_point(
        &mut self,
        elapsed: Duration,
        window: Duration,
        vus: u64,
        target_vus: u64,
    ) -> TimeSeriesPoint {
        let secs = window.as_secs_f64();
        let point = TimeSeriesPoint {
            timestamp: Utc::now().timestamp(),
            elapsed_secs: elapsed.as_secs_f64(),
            vus,
            target_vus,
            iterations: self.total_iterations,
            iterations_per_second: if secs > 0.0 {
                self.total_iterations as f64 / secs
            } else {
                0.0
            },
            avg_iteration_duration: self.get_average(),
            p95_iteration_duration: self.get_percentile(95.0),
            error_rate: self.error_rate(),
        };
        *self = Statistics::new();
        point
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
