//! Sliding-window throughput estimate fed by completed fragments.

use std::collections::VecDeque;
use std::time::Duration;

/// Smoothed bytes-per-second estimate over the last `capacity` fetches.
///
/// The estimate is total bytes over total time within the window, so one fast tiny
/// fetch cannot dominate a series of large slow ones.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    samples: VecDeque<(u64, Duration)>,
    capacity: usize,
}

impl ThroughputEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one completed transfer.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        // Sub-millisecond loopback fetches would otherwise divide by ~zero.
        let elapsed = elapsed.max(Duration::from_millis(1));
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((bytes, elapsed));
    }

    /// Current estimate in bytes per second, or `None` before the first sample.
    pub fn estimate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let (bytes, secs) = self
            .samples
            .iter()
            .fold((0u64, 0f64), |(b, s), (bytes, elapsed)| {
                (b.saturating_add(*bytes), s + elapsed.as_secs_f64())
            });
        Some(bytes as f64 / secs)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_has_no_estimate() {
        let est = ThroughputEstimator::new(5);
        assert!(est.estimate().is_none());
    }

    #[test]
    fn estimate_is_bytes_over_total_time() {
        let mut est = ThroughputEstimator::new(5);
        est.record(1_000, Duration::from_secs(1));
        est.record(3_000, Duration::from_secs(1));
        assert_eq!(est.estimate(), Some(2_000.0));
    }

    #[test]
    fn window_drops_oldest_samples() {
        let mut est = ThroughputEstimator::new(2);
        est.record(1_000_000, Duration::from_millis(10));
        est.record(1_000, Duration::from_secs(1));
        est.record(1_000, Duration::from_secs(1));
        assert_eq!(est.len(), 2);
        assert_eq!(est.estimate(), Some(1_000.0));
    }

    #[test]
    fn zero_duration_is_floored() {
        let mut est = ThroughputEstimator::new(1);
        est.record(10, Duration::ZERO);
        assert_eq!(est.estimate(), Some(10_000.0));
    }

    #[test]
    fn zero_capacity_keeps_one_sample() {
        let mut est = ThroughputEstimator::new(0);
        est.record(10, Duration::from_secs(1));
        est.record(20, Duration::from_secs(1));
        assert_eq!(est.len(), 1);
    }
}
