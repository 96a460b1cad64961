use std::path::PathBuf;

use audio_stream_types::LoadStrategy;
use clap::{Parser, Subcommand, ValueEnum};
use stream_player::PlayerSettings;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "stream-player", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Preferred output sample rate (Hz)
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Chunk cache database file
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    /// Play without the chunk cache
    #[arg(long)]
    pub no_cache: bool,

    /// Limit parallel range requests to two
    #[arg(long)]
    pub memory_constrained: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream and play a remote audio file
    Play {
        url: String,

        /// Cache key (defaults to the URL)
        #[arg(long)]
        track_id: Option<String>,

        /// Display name stored with the cached track
        #[arg(long)]
        name: Option<String>,

        /// Override the size/connection based strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Output volume, 0.0 to 1.0
        #[arg(long)]
        volume: Option<f32>,
    },

    /// Report range support, size and the strategy a play would use
    Probe { url: String },

    /// List output devices
    Devices,

    /// Inspect or prune the chunk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// List cached tracks, most recently played first
    List,
    /// Totals for tracks, blocks and bytes
    Stats,
    /// Apply the age and size limits now
    Evict,
    /// Remove one track and its blocks
    Remove { track_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyArg {
    Instant,
    Progressive,
    Standard,
}

impl From<StrategyArg> for LoadStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Instant => LoadStrategy::Instant,
            StrategyArg::Progressive => LoadStrategy::Progressive,
            StrategyArg::Standard => LoadStrategy::Standard,
        }
    }
}

impl Args {
    /// Flags win over file values.
    pub fn apply(&self, settings: &mut PlayerSettings) {
        if let Some(device) = self.device.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            settings.output.device = Some(device.to_string());
        }
        if self.sample_rate.is_some() {
            settings.output.target_rate = self.sample_rate;
        }
        if self.memory_constrained {
            settings.fetch.memory_constrained = true;
        }
        if self.no_cache {
            settings.store = None;
        } else if let Some(path) = &self.cache_path {
            let mut store = settings.store.take().unwrap_or_default();
            store.path = path.clone();
            settings.store = Some(store);
        }
        if let Command::Play {
            strategy, volume, ..
        } = &self.cmd
        {
            if let Some(strategy) = strategy {
                settings.strategy = Some((*strategy).into());
            }
            if let Some(volume) = volume.filter(|v| v.is_finite()) {
                settings.volume = volume.clamp(0.0, 1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_flags_override_settings() {
        let args = Args::parse_from([
            "stream-player",
            "--device",
            " DAC ",
            "--no-cache",
            "play",
            "https://cdn.test/a.mp3",
            "--strategy",
            "standard",
            "--volume",
            "0.25",
        ]);
        let mut settings = PlayerSettings {
            store: Some(chunk_store::StoreConfig::default()),
            ..PlayerSettings::default()
        };
        args.apply(&mut settings);
        assert_eq!(settings.output.device.as_deref(), Some("DAC"));
        assert!(settings.store.is_none());
        assert_eq!(settings.strategy, Some(LoadStrategy::Standard));
        assert_eq!(settings.volume, 0.25);
    }

    #[test]
    fn cache_path_enables_store() {
        let args = Args::parse_from([
            "stream-player",
            "--cache-path",
            "/tmp/blocks.sqlite",
            "cache",
            "stats",
        ]);
        let mut settings = PlayerSettings::default();
        args.apply(&mut settings);
        assert_eq!(
            settings.store.map(|s| s.path),
            Some(PathBuf::from("/tmp/blocks.sqlite"))
        );
        assert!(matches!(
            args.cmd,
            Command::Cache {
                action: CacheAction::Stats
            }
        ));
    }
}
