//! Fetch tuning parameters.

use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Download tuning shared by the planner, the fan-out, and the retry policy.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Size of the first planned chunk.
    pub initial_chunk_bytes: u64,
    /// Size of every later chunk before adaptive scaling.
    pub standard_chunk_bytes: u64,
    /// Lower bound for adaptive chunk sizes.
    pub min_chunk_bytes: u64,
    /// Upper bound for adaptive chunk sizes.
    pub max_chunk_bytes: u64,
    /// Throughput (bytes/s) above which the standard chunk size is doubled.
    pub high_speed_bytes_per_sec: f64,
    /// Throughput (bytes/s) below which the standard chunk size is halved.
    pub low_speed_bytes_per_sec: f64,
    /// Number of recent fragments kept in the throughput window.
    pub throughput_window: usize,
    /// Parallel chunk requests on unconstrained targets.
    pub max_concurrency: usize,
    /// Memory-constrained targets fan out to at most two requests.
    pub memory_constrained: bool,
    /// Fetch the first chunk alone before starting the concurrent batch.
    pub priority_first_chunk: bool,
    /// Retries per fragment for transport errors and 5xx/429 statuses.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
    /// Fetches slower than this are logged.
    pub slow_fetch_warning: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            initial_chunk_bytes: 256 * KIB,
            standard_chunk_bytes: 512 * KIB,
            min_chunk_bytes: 64 * KIB,
            max_chunk_bytes: MIB,
            high_speed_bytes_per_sec: 2.0 * MIB as f64,
            low_speed_bytes_per_sec: 256.0 * KIB as f64,
            throughput_window: 5,
            max_concurrency: 4,
            memory_constrained: false,
            priority_first_chunk: true,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(2),
            slow_fetch_warning: Duration::from_millis(250),
        }
    }
}

impl FetchConfig {
    /// Effective fan-out width for the current target.
    pub fn concurrency(&self) -> usize {
        if self.memory_constrained {
            2
        } else {
            self.max_concurrency.clamp(1, 6)
        }
    }
}
