use std::path::PathBuf;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Chunk store tuning.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// SQLite database file; parent directories are created on open.
    pub path: PathBuf,
    /// Total open attempts, including the first.
    pub open_attempts: u32,
    /// Delay before retry *n*; the last entry repeats.
    pub open_retry_delays: Vec<Duration>,
    /// Deadline for one open attempt.
    pub open_timeout: Duration,
    /// Deadline for every read/write after open.
    pub op_timeout: Duration,
    pub max_age: Duration,
    pub max_total_bytes: u64,
    pub pool_size: u32,
    /// Run [`evict`](crate::ChunkStore::evict) right after a successful open.
    pub evict_on_open: bool,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub(crate) fn retry_delay(&self, retry: usize) -> Duration {
        self.open_retry_delays
            .get(retry)
            .or_else(|| self.open_retry_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chunk-store.sqlite"),
            open_attempts: 3,
            open_retry_delays: vec![Duration::from_millis(500), Duration::from_millis(1000)],
            open_timeout: Duration::from_secs(10),
            op_timeout: Duration::from_secs(5),
            max_age: 10 * DAY,
            max_total_bytes: 1024 * 1024 * 1024,
            pool_size: 4,
            evict_on_open: true,
        }
    }
}
