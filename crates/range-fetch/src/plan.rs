//! Download chunk planning.
//!
//! The first chunk uses `initial_chunk_bytes`; later chunks use `standard_chunk_bytes`,
//! doubled on fast links and halved on slow ones, bounded by the configured floor and
//! ceiling. [`AdaptivePlan`] is lazy: each descriptor is sized from the throughput
//! estimate at the moment the fan-out asks for it.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::config::FetchConfig;
use crate::throughput::ThroughputEstimator;

/// One planned byte range request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u64,
    /// Half-open byte range.
    pub range: Range<u64>,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// `Range` header value (inclusive end).
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.range.start, self.range.end.saturating_sub(1))
    }
}

/// Size for a non-initial chunk given the current throughput estimate.
pub fn adaptive_chunk_size(config: &FetchConfig, estimate: Option<f64>) -> u64 {
    let floor = config.min_chunk_bytes.max(1);
    let ceiling = config.max_chunk_bytes.max(floor);
    let base = config.standard_chunk_bytes;
    let sized = match estimate {
        Some(bps) if bps > config.high_speed_bytes_per_sec => base.saturating_mul(2),
        Some(bps) if bps < config.low_speed_bytes_per_sec => base / 2,
        _ => base,
    };
    sized.clamp(floor, ceiling)
}

/// Lazily sized plan covering `[0, total_size)`.
pub struct AdaptivePlan {
    config: FetchConfig,
    throughput: Option<Arc<Mutex<ThroughputEstimator>>>,
    total_size: u64,
    next_start: u64,
    next_index: u64,
}

impl AdaptivePlan {
    pub fn new(
        config: FetchConfig,
        throughput: Option<Arc<Mutex<ThroughputEstimator>>>,
        total_size: u64,
    ) -> Self {
        Self {
            config,
            throughput,
            total_size,
            next_start: 0,
            next_index: 0,
        }
    }

    fn current_estimate(&self) -> Option<f64> {
        let est = self.throughput.as_ref()?;
        est.lock().ok().and_then(|g| g.estimate())
    }
}

impl Iterator for AdaptivePlan {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<ChunkDescriptor> {
        if self.next_start >= self.total_size {
            return None;
        }
        let size = if self.next_index == 0 {
            self.config.initial_chunk_bytes.max(1)
        } else {
            adaptive_chunk_size(&self.config, self.current_estimate())
        };
        let start = self.next_start;
        let end = start.saturating_add(size).min(self.total_size);
        let desc = ChunkDescriptor {
            index: self.next_index,
            range: start..end,
        };
        self.next_start = end;
        self.next_index += 1;
        Some(desc)
    }
}

/// Materialise a plan with a fixed estimate.
pub fn build_plan(config: &FetchConfig, estimate: Option<f64>, total_size: u64) -> Vec<ChunkDescriptor> {
    let standard = adaptive_chunk_size(config, estimate);
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut index = 0u64;
    while start < total_size {
        let size = if index == 0 {
            config.initial_chunk_bytes.max(1)
        } else {
            standard
        };
        let end = start.saturating_add(size).min(total_size);
        out.push(ChunkDescriptor {
            index,
            range: start..end,
        });
        start = end;
        index += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KIB, MIB};
    use std::time::Duration;

    #[test]
    fn plan_starts_with_initial_then_standard() {
        let cfg = FetchConfig::default();
        let plan = build_plan(&cfg, None, 2 * MIB);
        assert_eq!(plan[0].range, 0..256 * KIB);
        assert_eq!(plan[1].len(), 512 * KIB);
        assert_eq!(plan.last().map(|d| d.range.end), Some(2 * MIB));
        let covered: u64 = plan.iter().map(|d| d.len()).sum();
        assert_eq!(covered, 2 * MIB);
        for (i, d) in plan.iter().enumerate() {
            assert_eq!(d.index, i as u64);
        }
    }

    #[test]
    fn fast_link_doubles_and_slow_link_halves() {
        let cfg = FetchConfig::default();
        assert_eq!(adaptive_chunk_size(&cfg, Some(10.0 * MIB as f64)), MIB);
        assert_eq!(adaptive_chunk_size(&cfg, Some(10.0 * KIB as f64)), 256 * KIB);
        assert_eq!(adaptive_chunk_size(&cfg, Some(MIB as f64)), 512 * KIB);
    }

    #[test]
    fn adaptive_size_respects_floor_and_ceiling() {
        let cfg = FetchConfig {
            standard_chunk_bytes: 96 * KIB,
            ..FetchConfig::default()
        };
        assert_eq!(adaptive_chunk_size(&cfg, Some(1.0)), 64 * KIB);

        let cfg = FetchConfig {
            standard_chunk_bytes: 900 * KIB,
            ..FetchConfig::default()
        };
        assert_eq!(adaptive_chunk_size(&cfg, Some(100.0 * MIB as f64)), MIB);
    }

    #[test]
    fn small_file_is_single_chunk() {
        let plan = build_plan(&FetchConfig::default(), None, 1000);
        assert_eq!(plan, vec![ChunkDescriptor { index: 0, range: 0..1000 }]);
        assert_eq!(plan[0].header_value(), "bytes=0-999");
    }

    #[test]
    fn empty_file_has_empty_plan() {
        assert!(build_plan(&FetchConfig::default(), None, 0).is_empty());
    }

    #[test]
    fn adaptive_plan_reacts_to_estimate_between_chunks() {
        let est = Arc::new(Mutex::new(ThroughputEstimator::new(5)));
        let mut plan = AdaptivePlan::new(FetchConfig::default(), Some(est.clone()), 10 * MIB);

        let first = plan.next().expect("first");
        assert_eq!(first.len(), 256 * KIB);
        let second = plan.next().expect("second");
        assert_eq!(second.len(), 512 * KIB);

        est.lock()
            .expect("lock")
            .record(10 * MIB, Duration::from_secs(1));
        let third = plan.next().expect("third");
        assert_eq!(third.range.start, second.range.end);
        assert_eq!(third.len(), MIB);
    }
}
