//! Subcommand implementations.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use audio_player::device::list_device_infos;
use audio_player::{EngineEvent, OutputHost};
use chunk_store::ChunkStore;
use range_fetch::RangeFetcher;
use stream_player::{FileConfig, PlayCallbacks, PlayerSettings, StreamPlayer, select_strategy};
use tokio_util::sync::CancellationToken;

use crate::cli::{Args, CacheAction, Command};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn run(args: Args) -> Result<()> {
    let settings = load_settings(&args)?;
    match args.cmd {
        Command::Play {
            url,
            track_id,
            name,
            ..
        } => {
            let track_id = track_id.unwrap_or_else(|| url.clone());
            let name = name.unwrap_or_else(|| display_name_from_url(&url));
            run_play(settings, &url, &track_id, &name).await
        }
        Command::Probe { url } => run_probe(settings, &url).await,
        Command::Devices => list_devices(),
        Command::Cache { action } => run_cache(settings, action).await,
    }
}

fn load_settings(args: &Args) -> Result<PlayerSettings> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let mut settings = file.resolve();
    args.apply(&mut settings);
    Ok(settings)
}

async fn run_play(settings: PlayerSettings, url: &str, track_id: &str, name: &str) -> Result<()> {
    let fetcher = RangeFetcher::new(settings.fetch.clone()).context("build http client")?;
    let store = match settings.store.clone() {
        Some(cfg) => match ChunkStore::open(cfg).await {
            Ok(store) => Some(store),
            Err(err) => {
                tracing::warn!(error = %err, "chunk cache unavailable; playing without caching");
                None
            }
        },
        None => None,
    };

    let (handle, engine) = audio_player::engine::channel(&settings.engine);
    let output = OutputHost::start(Arc::new(Mutex::new(engine)), settings.output.clone())
        .context("start audio output")?;
    let output = Arc::new(output);
    tracing::info!(
        rate_hz = output.sample_rate(),
        channels = output.channels(),
        "output ready"
    );

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.cancel()).context("install ctrl-c handler")?;
    }

    let player = StreamPlayer::new(settings, fetcher, store, handle.clone(), output.clone());
    let callbacks = PlayCallbacks::default()
        .on_chunk_loaded(|p| {
            tracing::debug!(
                index = p.block_index,
                loaded = p.loaded_bytes,
                total = ?p.total_bytes,
                "chunk loaded"
            )
        })
        .on_fully_loaded(|s| {
            tracing::info!(
                blocks = s.blocks,
                duration_s = s.duration_seconds,
                from_cache = s.from_cache,
                "fully loaded"
            )
        });

    let started = tokio::select! {
        started = player.play_instantly(url, track_id, name, callbacks) => started?,
        _ = stop.cancelled() => {
            player.stop()?;
            return Ok(());
        }
    };
    println!(
        "playing {name} ({:?} via {:?}, {:.1}s buffered)",
        started.strategy, started.source, started.buffered_seconds
    );

    let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                player.stop()?;
                break;
            }
            _ = ticker.tick() => {}
        }
        for event in output.events().try_iter() {
            player.handle_output_event(&event);
        }
        let mut ended = false;
        for event in handle.try_events() {
            match event {
                EngineEvent::TimeUpdate {
                    position_seconds,
                    duration_seconds,
                } => {
                    print!("\r{} / {}", clock(position_seconds), clock(duration_seconds));
                    let _ = std::io::stdout().flush();
                }
                EngineEvent::BufferSwitched {
                    block_index,
                    duration_seconds,
                    ..
                } => tracing::debug!(block_index, duration_s = duration_seconds, "buffer switched"),
                EngineEvent::ReplaceRejected {
                    block_index,
                    reason,
                } => tracing::warn!(block_index, ?reason, "buffer replacement rejected"),
                EngineEvent::Ended { .. } => ended = true,
            }
        }
        // Ended fires once, after the last block of the track has played.
        if ended {
            break;
        }
    }
    println!();
    let status = player.position();
    if status.underrun_frames > 0 {
        tracing::info!(underrun_frames = status.underrun_frames, "playback finished with underruns");
    }
    Ok(())
}

async fn run_probe(settings: PlayerSettings, url: &str) -> Result<()> {
    let fetcher = RangeFetcher::new(settings.fetch.clone()).context("build http client")?;
    let probe = fetcher.probe(url).await.context("probe")?;
    let strategy = settings
        .strategy
        .unwrap_or_else(|| select_strategy(probe.total_size, fetcher.connection_class()));
    println!("url:           {}", probe.url);
    println!("byte ranges:   {}", if probe.supports_ranges { "yes" } else { "no" });
    match probe.total_size {
        Some(size) => {
            println!("size:          {size} bytes");
            println!("range chunks:  {}", fetcher.fetch_plan(size).len());
        }
        None => println!("size:          unknown"),
    }
    println!(
        "content type:  {}",
        probe.content_type.as_deref().unwrap_or("-")
    );
    println!("strategy:      {strategy:?}");
    Ok(())
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for info in list_device_infos(&host)? {
        let marker = if info.is_default { "*" } else { " " };
        let default_rate = info
            .default_rate
            .map(|r| format!("{r} Hz"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{marker} {}  (default {default_rate}, {}-{} Hz)",
            info.name, info.min_rate, info.max_rate
        );
    }
    Ok(())
}

async fn run_cache(settings: PlayerSettings, action: CacheAction) -> Result<()> {
    let cfg = settings
        .store
        .context("chunk cache is disabled in this configuration")?;
    let store = ChunkStore::open(cfg).await.context("open chunk cache")?;
    match action {
        CacheAction::List => {
            for track in store.list_tracks().await? {
                println!(
                    "{}  {}  {}  {} blocks  {} bytes",
                    track.track_id,
                    track.display_name,
                    clock(track.duration_seconds),
                    track.total_block_count,
                    track.file_size_bytes
                );
            }
        }
        CacheAction::Stats => {
            let stats = store.stats().await?;
            println!("tracks:  {}", stats.tracks);
            println!("blocks:  {}", stats.blocks);
            println!("bytes:   {}", stats.payload_bytes);
        }
        CacheAction::Evict => {
            let report = store.evict().await?;
            println!(
                "expired: {}  over budget: {}  freed: {} bytes",
                report.expired.len(),
                report.over_budget.len(),
                report.bytes_freed
            );
        }
        CacheAction::Remove { track_id } => {
            if store.delete_track(&track_id).await? {
                println!("removed {track_id}");
            } else {
                println!("{track_id} is not cached");
            }
        }
    }
    Ok(())
}

fn clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn display_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_formats_minutes_and_seconds() {
        assert_eq!(clock(0.0), "0:00");
        assert_eq!(clock(75.9), "1:15");
        assert_eq!(clock(-3.0), "0:00");
    }

    #[test]
    fn display_name_uses_last_path_segment() {
        assert_eq!(
            display_name_from_url("https://cdn.test/music/song.flac?token=1"),
            "song.flac"
        );
        assert_eq!(display_name_from_url("https://cdn.test/"), "cdn.test");
    }
}
