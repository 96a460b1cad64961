//! Configuration loading and parsing.
//!
//! The TOML file has optional `[fetch]`, `[assembler]`, `[store]`, `[engine]` and `[player]`
//! tables. Every field is optional; anything unset keeps the component default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use audio_player::{EngineConfig, OutputConfig};
use audio_stream_types::LoadStrategy;
use chunk_store::StoreConfig;
use range_fetch::{AssemblerConfig, FetchConfig};
use serde::Deserialize;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Storage blocks are kept between these sizes.
pub const MIN_STORAGE_BLOCK_BYTES: u64 = MIB;
pub const MAX_STORAGE_BLOCK_BYTES: u64 = 3 * MIB;

/// Top-level config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub fetch: Option<FetchSection>,
    pub assembler: Option<AssemblerSection>,
    pub store: Option<StoreSection>,
    pub engine: Option<EngineSection>,
    pub player: Option<PlayerSection>,
}

/// `[fetch]`: range planning and retry.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchSection {
    /// First planned chunk (default 256).
    pub initial_chunk_kib: Option<u64>,
    /// Later chunks before adaptive scaling (default 512).
    pub standard_chunk_kib: Option<u64>,
    pub min_chunk_kib: Option<u64>,
    pub max_chunk_kib: Option<u64>,
    /// Double the chunk size above this throughput (default 2048).
    pub high_speed_kib_per_sec: Option<f64>,
    /// Halve the chunk size below this throughput (default 256).
    pub low_speed_kib_per_sec: Option<f64>,
    pub throughput_window: Option<usize>,
    pub max_concurrency: Option<usize>,
    /// Limit fan-out to two requests.
    pub memory_constrained: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
}

/// `[assembler]`: block sizes.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssemblerSection {
    pub first_playable_kib: Option<u64>,
    /// Clamped to 1–3 MiB.
    pub storage_block_kib: Option<u64>,
}

/// `[store]`: block cache.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Set to `false` to play without caching.
    pub enabled: Option<bool>,
    pub path: Option<PathBuf>,
    pub max_age_days: Option<u64>,
    pub max_total_mib: Option<u64>,
    pub open_attempts: Option<u32>,
    pub open_timeout_ms: Option<u64>,
    pub op_timeout_ms: Option<u64>,
}

/// `[engine]`: render engine.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    pub guard_interval_seconds: Option<f64>,
    pub time_update_hz: Option<u32>,
    pub schedule_capacity: Option<usize>,
}

/// `[player]`: output device and request handling.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerSection {
    /// Output device name substring.
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    /// Poll the device default rate once per second.
    pub poll_sample_rate: Option<bool>,
    pub first_block_deadline_ms: Option<u64>,
    /// Force a load strategy instead of deriving one per request.
    pub strategy: Option<LoadStrategy>,
    pub volume: Option<f32>,
}

/// Fully resolved settings for a [`StreamPlayer`](crate::StreamPlayer).
#[derive(Clone, Debug)]
pub struct PlayerSettings {
    pub fetch: FetchConfig,
    pub assembler: AssemblerConfig,
    /// `None` disables caching.
    pub store: Option<StoreConfig>,
    pub engine: EngineConfig,
    pub output: OutputConfig,
    /// How long the range download may go without a single fragment before falling back
    /// to a single-stream GET.
    pub first_block_deadline: Duration,
    pub strategy: Option<LoadStrategy>,
    pub volume: f32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            assembler: AssemblerConfig::default(),
            store: None,
            engine: EngineConfig::default(),
            output: OutputConfig::default(),
            first_block_deadline: Duration::from_millis(500),
            strategy: None,
            volume: 1.0,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid config toml")
    }

    /// Apply file values over the defaults.
    pub fn resolve(self) -> PlayerSettings {
        let mut settings = PlayerSettings::default();

        if let Some(fetch) = self.fetch {
            let cfg = &mut settings.fetch;
            set_kib(&mut cfg.initial_chunk_bytes, fetch.initial_chunk_kib);
            set_kib(&mut cfg.standard_chunk_bytes, fetch.standard_chunk_kib);
            set_kib(&mut cfg.min_chunk_bytes, fetch.min_chunk_kib);
            set_kib(&mut cfg.max_chunk_bytes, fetch.max_chunk_kib);
            if let Some(v) = fetch.high_speed_kib_per_sec {
                cfg.high_speed_bytes_per_sec = v * KIB as f64;
            }
            if let Some(v) = fetch.low_speed_kib_per_sec {
                cfg.low_speed_bytes_per_sec = v * KIB as f64;
            }
            if let Some(v) = fetch.throughput_window {
                cfg.throughput_window = v.max(1);
            }
            if let Some(v) = fetch.max_concurrency {
                cfg.max_concurrency = v;
            }
            if let Some(v) = fetch.memory_constrained {
                cfg.memory_constrained = v;
            }
            if let Some(v) = fetch.max_retries {
                cfg.max_retries = v;
            }
            if let Some(ms) = fetch.retry_base_delay_ms {
                cfg.retry_base_delay = Duration::from_millis(ms);
            }
            if cfg.min_chunk_bytes > cfg.max_chunk_bytes {
                cfg.max_chunk_bytes = cfg.min_chunk_bytes;
            }
        }

        if let Some(asm) = self.assembler {
            set_kib(&mut settings.assembler.first_playable_bytes, asm.first_playable_kib);
            set_kib(&mut settings.assembler.storage_block_bytes, asm.storage_block_kib);
        }
        settings.assembler = clamp_assembler(settings.assembler);

        let store = self.store.unwrap_or_default();
        if store.enabled.unwrap_or(true) {
            let mut cfg = StoreConfig::at(store.path.unwrap_or_else(default_store_path));
            if let Some(days) = store.max_age_days {
                cfg.max_age = Duration::from_secs(days.saturating_mul(DAY.as_secs()));
            }
            if let Some(mib) = store.max_total_mib {
                cfg.max_total_bytes = mib.saturating_mul(MIB);
            }
            if let Some(n) = store.open_attempts {
                cfg.open_attempts = n.max(1);
            }
            if let Some(ms) = store.open_timeout_ms {
                cfg.open_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = store.op_timeout_ms {
                cfg.op_timeout = Duration::from_millis(ms);
            }
            settings.store = Some(cfg);
        }

        if let Some(engine) = self.engine {
            if let Some(v) = engine.guard_interval_seconds {
                settings.engine.guard_interval_seconds = v.max(0.0);
            }
            if let Some(v) = engine.time_update_hz {
                settings.engine.time_update_hz = v.max(1);
            }
            if let Some(v) = engine.schedule_capacity {
                settings.engine.schedule_capacity = v.max(1);
            }
        }

        if let Some(player) = self.player {
            settings.output.device = normalize_device_name(player.device);
            settings.output.target_rate = player.sample_rate;
            if let Some(v) = player.poll_sample_rate {
                settings.output.poll_sample_rate = v;
            }
            if let Some(ms) = player.first_block_deadline_ms {
                settings.first_block_deadline = Duration::from_millis(ms);
            }
            settings.strategy = player.strategy;
            if let Some(v) = player.volume.filter(|v| v.is_finite()) {
                settings.volume = v.clamp(0.0, 1.0);
            }
        }

        settings
    }
}

/// Keep storage blocks within 1–3 MiB and block 0 no larger than a storage block.
pub fn clamp_assembler(cfg: AssemblerConfig) -> AssemblerConfig {
    let storage = cfg
        .storage_block_bytes
        .clamp(MIN_STORAGE_BLOCK_BYTES, MAX_STORAGE_BLOCK_BYTES);
    AssemblerConfig {
        first_playable_bytes: cfg.first_playable_bytes.clamp(16 * KIB, storage),
        storage_block_bytes: storage,
    }
}

/// `$XDG_CACHE_HOME/stream-player/chunks.sqlite`, then `$HOME/.cache/...`, then the temp dir.
pub fn default_store_path() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("stream-player").join("chunks.sqlite")
}

pub(crate) fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn set_kib(target: &mut u64, value: Option<u64>) {
    if let Some(kib) = value {
        *target = kib.saturating_mul(KIB).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults_with_cache_enabled() {
        let settings = FileConfig::parse("").expect("parse").resolve();
        assert_eq!(settings.fetch.initial_chunk_bytes, 256 * KIB);
        assert_eq!(settings.assembler.first_playable_bytes, 256 * KIB);
        assert_eq!(settings.assembler.storage_block_bytes, 2 * MIB);
        assert_eq!(settings.first_block_deadline, Duration::from_millis(500));
        let store = settings.store.expect("store enabled by default");
        assert!(store.path.ends_with("stream-player/chunks.sqlite"));
        assert_eq!(store.max_age, 10 * DAY);
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            [fetch]
            initial_chunk_kib = 128
            memory_constrained = true

            [assembler]
            storage_block_kib = 1536

            [store]
            path = "/tmp/cache.sqlite"
            max_age_days = 3
            max_total_mib = 64

            [engine]
            guard_interval_seconds = 0.5

            [player]
            device = "  USB DAC "
            strategy = "progressive"
            volume = 2.0
            first_block_deadline_ms = 1500
        "#;
        let settings = FileConfig::parse(raw).expect("parse").resolve();
        assert_eq!(settings.fetch.initial_chunk_bytes, 128 * KIB);
        assert_eq!(settings.fetch.concurrency(), 2);
        assert_eq!(settings.assembler.storage_block_bytes, 1536 * KIB);
        let store = settings.store.expect("store");
        assert_eq!(store.path, PathBuf::from("/tmp/cache.sqlite"));
        assert_eq!(store.max_age, 3 * DAY);
        assert_eq!(store.max_total_bytes, 64 * MIB);
        assert_eq!(settings.engine.guard_interval_seconds, 0.5);
        assert_eq!(settings.output.device.as_deref(), Some("USB DAC"));
        assert_eq!(settings.strategy, Some(LoadStrategy::Progressive));
        assert_eq!(settings.volume, 1.0);
        assert_eq!(settings.first_block_deadline, Duration::from_millis(1500));
    }

    #[test]
    fn oversized_store_limits_saturate() {
        let raw = format!("[store]\nmax_age_days = {}\nmax_total_mib = {}\n", i64::MAX, i64::MAX);
        let store = FileConfig::parse(&raw)
            .expect("parse")
            .resolve()
            .store
            .expect("store");
        assert_eq!(store.max_age, Duration::from_secs(u64::MAX));
        assert!(store.max_age > 50_000 * DAY);
        assert_eq!(store.max_total_bytes, u64::MAX);

        let settings = FileConfig::parse("[store]\nmax_age_days = 4294967297\n")
            .expect("parse")
            .resolve();
        assert_eq!(settings.store.expect("store").max_age.as_secs(), 4_294_967_297 * 86_400);
    }

    #[test]
    fn store_can_be_disabled() {
        let settings = FileConfig::parse("[store]\nenabled = false\n")
            .expect("parse")
            .resolve();
        assert!(settings.store.is_none());
    }

    #[test]
    fn storage_block_size_is_clamped() {
        let small = clamp_assembler(AssemblerConfig {
            first_playable_bytes: 4 * MIB,
            storage_block_bytes: 100 * KIB,
        });
        assert_eq!(small.storage_block_bytes, MIB);
        assert_eq!(small.first_playable_bytes, MIB);

        let large = clamp_assembler(AssemblerConfig {
            first_playable_bytes: 256 * KIB,
            storage_block_bytes: 16 * MIB,
        });
        assert_eq!(large.storage_block_bytes, 3 * MIB);
        assert_eq!(large.first_playable_bytes, 256 * KIB);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("[fetch]\nchunk = 1\n").is_err());
    }

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some(" USB  DAC ".to_string())),
            Some("USB  DAC".to_string())
        );
    }
}
