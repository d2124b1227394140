// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Running statistics for per-record solve metrics (duration, attempts
//! used, success as 0/1). Each metric is summarized twice: over a short
//! window of the latest records, and over every record since the last
//! reset.

use std::fmt;

use medians::Medianf64;
use rolling_stats::Stats;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    // Only computed for the recent window.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

impl DescriptiveStats {
    // Summarizes a non-empty slice; order does not matter.
    fn of_window(values: &[f64]) -> Self {
        let mean = statistical::mean(values);
        let stddev = if values.len() > 1 {
            statistical::standard_deviation(values, Some(mean))
        } else {
            0.0
        };
        let median = values.medf_unchecked();
        DescriptiveStats{
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean,
            stddev,
            median: Some(median),
            median_absolute_deviation: Some(values.madf(median)),
        }
    }

    fn of_running(stats: &Stats<f64>) -> Self {
        DescriptiveStats{
            min: stats.min,
            max: stats.max,
            mean: stats.mean,
            stddev: stats.std_dev,
            median: None,
            median_absolute_deviation: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValueStats {
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,
    pub session_count: usize,
}

impl fmt::Display for ValueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={} mean {:.2} stddev {:.2} min {:.2} max {:.2}",
               self.session_count, self.session.mean, self.session.stddev,
               self.session.min, self.session.max)?;
        if let Some(median) = self.recent.median {
            write!(f, "; recent mean {:.2} median {:.2}", self.recent.mean, median)?;
        }
        Ok(())
    }
}

pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,
    window: RecentWindow,
    running: Stats<f64>,
}

impl ValueStatsAccumulator {
    /// `capacity` is the size of the recent window; zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        ValueStatsAccumulator{
            value_stats: ValueStats::default(),
            window: RecentWindow::new(capacity.max(1)),
            running: Stats::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.window.insert(value);
        self.running.update(value);
        self.value_stats.recent = DescriptiveStats::of_window(self.window.values());
        self.value_stats.session = DescriptiveStats::of_running(&self.running);
        self.value_stats.session_count += 1;
    }

    /// Starts a new session. The recent window is kept.
    pub fn reset_session(&mut self) {
        self.running = Stats::new();
        self.value_stats.session = DescriptiveStats::default();
        self.value_stats.session_count = 0;
    }
}

// Fixed-size window over the latest values. Once full, each insert
// overwrites the oldest slot, so values() is unordered.
#[derive(Debug)]
struct RecentWindow {
    slots: Vec<f64>,
    oldest: usize,
    capacity: usize,
}

impl RecentWindow {
    fn new(capacity: usize) -> Self {
        RecentWindow{slots: Vec::with_capacity(capacity), oldest: 0, capacity}
    }

    fn insert(&mut self, value: f64) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
            return;
        }
        self.slots[self.oldest] = value;
        self.oldest = (self.oldest + 1) % self.capacity;
    }

    fn values(&self) -> &[f64] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_recent_window() {
        let mut window = RecentWindow::new(2);
        assert!(window.values().is_empty());
        window.insert(12.5);
        window.insert(30.0);
        assert_eq!(window.values(), [12.5, 30.0]);
        window.insert(8.0);
        assert_eq!(window.values(), [8.0, 30.0]);
        window.insert(9.0);
        assert_eq!(window.values(), [8.0, 9.0]);
    }

    #[test]
    fn test_solve_durations() {
        let mut durations = ValueStatsAccumulator::new(3);
        assert_eq!(durations.value_stats, ValueStats::default());

        durations.add_value(4.0);
        let recent = &durations.value_stats.recent;
        assert_eq!(recent.stddev, 0.0);
        assert_eq!(recent.median, Some(4.0));

        durations.add_value(6.0);
        durations.add_value(11.0);
        let recent = &durations.value_stats.recent;
        assert_eq!(recent.min, 4.0);
        assert_eq!(recent.max, 11.0);
        assert_eq!(recent.mean, 7.0);
        assert_abs_diff_eq!(recent.stddev, 3.61, epsilon = 0.01);
        assert_eq!(recent.median, Some(6.0));
        assert_eq!(recent.median_absolute_deviation, Some(2.0));

        // A slow blind solve pushes 4.0 out of the window but not the session.
        durations.add_value(45.0);
        assert_eq!(durations.value_stats.recent.min, 6.0);
        let session = &durations.value_stats.session;
        assert_eq!(session.min, 4.0);
        assert_eq!(session.max, 45.0);
        assert_eq!(session.mean, 16.5);
        assert_eq!(session.median, None);
        assert_eq!(durations.value_stats.session_count, 4);

        durations.reset_session();
        assert_eq!(durations.value_stats.session, DescriptiveStats::default());
        assert_eq!(durations.value_stats.session_count, 0);
        assert_eq!(durations.value_stats.recent.max, 45.0);
        durations.add_value(5.0);
        assert_eq!(durations.value_stats.session.min, 5.0);
        assert_eq!(durations.value_stats.session_count, 1);
    }

    #[test]
    fn test_success_rate_display() {
        let mut successes = ValueStatsAccumulator::new(10);
        for solved in [true, true, false, true] {
            successes.add_value(if solved { 1.0 } else { 0.0 });
        }
        assert_abs_diff_eq!(successes.value_stats.session.mean, 0.75, epsilon = 1e-9);
        assert_eq!(successes.value_stats.to_string(),
                   "n=4 mean 0.75 stddev 0.50 min 0.00 max 1.00; \
                    recent mean 0.75 median 1.00");
    }

}  // mod tests.
