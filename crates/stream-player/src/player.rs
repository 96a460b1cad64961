//! Playback requests.
//!
//! [`StreamPlayer::play_instantly`] wires fetcher, assembler, store and render engine together
//! for one track. It returns once audio is playing, or with a single terminal error when no
//! block could be made playable. Loading continues in a background task; a newer request
//! cancels it.

use std::sync::{Arc, Mutex, MutexGuard};

use audio_player::{EngineHandle, OutputEvent, PcmBuffer};
use audio_stream_types::{LoadStrategy, PositionSnapshot};
use chunk_store::ChunkStore;
use futures_util::FutureExt;
use range_fetch::{AssemblerConfig, RangeFetcher, RangeProbe};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PlayerSettings;
use crate::error::PlaybackError;
use crate::output::AudioOutput;
use crate::progress::{LoadSummary, PlayCallbacks};
use crate::session::{
    LoadRequest, LoadSession, Progress, SessionContext, SingleStreamFallback, StartPoint,
    extension_hint,
};
use crate::strategy::select_strategy;

/// Where the first playable audio came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Ranges,
    SingleStream,
}

/// Returned once audio is playing.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackStart {
    pub track_id: String,
    pub strategy: LoadStrategy,
    pub source: LoadSource,
    /// Duration of the first buffer handed to the engine.
    pub buffered_seconds: f64,
    /// Whether loading continues in the background.
    pub loading: bool,
}

struct ActiveLoad {
    track_id: Arc<str>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// One player instance per output; requests replace each other.
pub struct StreamPlayer {
    fetcher: RangeFetcher,
    store: Option<ChunkStore>,
    engine: EngineHandle,
    output: Arc<dyn AudioOutput>,
    settings: PlayerSettings,
    current: Mutex<Option<ActiveLoad>>,
}

impl StreamPlayer {
    pub fn new(
        settings: PlayerSettings,
        fetcher: RangeFetcher,
        store: Option<ChunkStore>,
        engine: EngineHandle,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        if let Err(err) = engine.set_volume(settings.volume) {
            tracing::warn!(error = %err, "initial volume not applied");
        }
        Self {
            fetcher,
            store,
            engine,
            output,
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn store(&self) -> Option<&ChunkStore> {
        self.store.as_ref()
    }

    /// Start playing `url` as soon as possible.
    ///
    /// Any previous request is cancelled first; its late blocks are dropped.
    pub async fn play_instantly(
        &self,
        url: &str,
        track_id: &str,
        display_name: &str,
        callbacks: PlayCallbacks,
    ) -> Result<PlaybackStart, PlaybackError> {
        let cancel = CancellationToken::new();
        let track: Arc<str> = Arc::from(track_id);
        self.replace_current(ActiveLoad {
            track_id: track.clone(),
            cancel: cancel.clone(),
            task: None,
        });

        if let Some(start) = self.play_from_cache(&track, &callbacks).await {
            return Ok(start);
        }

        let probe = match self.fetcher.probe(url).await {
            Ok(probe) => probe,
            Err(err) => {
                tracing::warn!(url, error = %err, "probe failed; trying a single stream");
                RangeProbe {
                    url: url.to_string(),
                    supports_ranges: false,
                    total_size: None,
                    content_type: None,
                }
            }
        };
        let strategy = self.settings.strategy.unwrap_or_else(|| {
            select_strategy(probe.total_size, self.fetcher.connection_class())
        });
        tracing::info!(
            %track_id,
            ?strategy,
            size = ?probe.total_size,
            ranges = probe.supports_ranges,
            "loading track"
        );

        let ctx = SessionContext {
            request: Arc::new(LoadRequest {
                track_id: track.clone(),
                display_name: display_name.to_string(),
                url: url.to_string(),
                extension: extension_hint(url, probe.content_type.as_deref()),
            }),
            engine: self.engine.clone(),
            store: self.store.clone(),
            output: self.output.clone(),
            callbacks,
            cancel: cancel.clone(),
        };

        let ranged = probe.require_ranges();
        let tried_ranges = ranged.is_ok();
        let attempt = match ranged {
            Ok(total) => {
                let mut session = self.range_session(ctx.clone(), total, strategy);
                session
                    .run(Progress::Started)
                    .await
                    .map(|progress| (session, progress))
            }
            Err(err) => {
                tracing::info!(%track_id, reason = %err, "byte ranges unavailable; single stream");
                self.single_stream(ctx.clone(), strategy).await
            }
        };

        let (mut session, progress) = match attempt {
            Ok(started) => started,
            Err(err) if tried_ranges && err.allows_fallback() => {
                tracing::warn!(%track_id, error = %err, "range load failed before playback; falling back to a single stream");
                self.single_stream(ctx, strategy)
                    .await
                    .map_err(|err| no_playable(track_id, err))?
            }
            Err(err) => return Err(no_playable(track_id, err)),
        };

        let source = session.source();
        let buffered_seconds = session.duration_seconds();
        let loading = progress == Progress::Started;
        if loading {
            let task_track = track.clone();
            let engine = self.engine.clone();
            let task = tokio::spawn(async move {
                match session.run(Progress::Finished).await {
                    Ok(_) => {}
                    Err(PlaybackError::Cancelled) => {
                        tracing::debug!(track_id = %task_track, "background load cancelled");
                    }
                    Err(err) => {
                        tracing::warn!(
                            track_id = %task_track,
                            error = %err,
                            "background load failed; playing what is buffered"
                        );
                        if !cancel.is_cancelled()
                            && let Err(err) = engine.end_of_stream()
                        {
                            tracing::warn!(track_id = %task_track, error = %err, "end of stream not sent");
                        }
                    }
                }
            });
            let mut current = self.lock_current();
            match current.as_mut() {
                Some(active) if Arc::ptr_eq(&active.track_id, &track) => active.task = Some(task),
                _ => task.abort(),
            }
        }

        Ok(PlaybackStart {
            track_id: track_id.to_string(),
            strategy,
            source,
            buffered_seconds,
            loading,
        })
    }

    /// Cancel loading and silence the engine.
    pub fn stop(&self) -> Result<(), PlaybackError> {
        if let Some(active) = self.lock_current().take() {
            active.cancel.cancel();
        }
        self.engine.stop()?;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        Ok(self.engine.pause()?)
    }

    pub fn resume(&self) -> Result<(), PlaybackError> {
        Ok(self.engine.play()?)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), PlaybackError> {
        Ok(self.engine.seek(seconds)?)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), PlaybackError> {
        Ok(self.engine.set_volume(volume)?)
    }

    pub fn position(&self) -> PositionSnapshot {
        self.engine.position()
    }

    /// Whether the current request is still downloading.
    pub fn is_loading(&self) -> bool {
        self.lock_current()
            .as_ref()
            .and_then(|active| active.task.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    /// Rebuild the output stream. Playback position is kept by the engine.
    pub fn reset_audio_context(&self) -> anyhow::Result<()> {
        tracing::info!(rate_hz = self.output.sample_rate(), "resetting audio context");
        self.output.reset()
    }

    /// React to an output fault; returns whether the audio context was reset.
    pub fn handle_output_event(&self, event: &OutputEvent) -> bool {
        let reset = match event {
            OutputEvent::SampleRateChanged { from, to } => {
                tracing::warn!(from, to, "device sample rate changed");
                true
            }
            OutputEvent::StreamError(message) => {
                tracing::warn!(%message, "output stream error");
                true
            }
            OutputEvent::Started { .. } => false,
        };
        if reset && let Err(err) = self.reset_audio_context() {
            tracing::error!(error = %err, "audio context reset failed");
        }
        reset
    }

    fn range_session(&self, ctx: SessionContext, total: u64, strategy: LoadStrategy) -> LoadSession {
        let (assembler, start, priority) = self.plan_for(strategy);
        let cancel = ctx.cancel.clone();
        let plan = self.fetcher.adaptive_plan(total);
        let fragments =
            self.fetcher
                .download_with_priority(&ctx.request.url, plan, priority, cancel.clone());
        let fetcher = self.fetcher.clone();
        let url = ctx.request.url.clone();
        let fallback = SingleStreamFallback {
            after: self.settings.first_block_deadline,
            open: async move { fetcher.stream_whole(&url, cancel).await }.boxed(),
        };
        LoadSession::new(ctx, fragments, Some(total), assembler, start, LoadSource::Ranges)
            .with_fallback(fallback)
    }

    async fn single_stream(
        &self,
        ctx: SessionContext,
        strategy: LoadStrategy,
    ) -> Result<(LoadSession, Progress), PlaybackError> {
        let (assembler, start, _) = self.plan_for(strategy);
        let (total, fragments) = self
            .fetcher
            .stream_whole(&ctx.request.url, ctx.cancel.clone())
            .await?;
        let mut session =
            LoadSession::new(ctx, fragments, total, assembler, start, LoadSource::SingleStream);
        let progress = session.run(Progress::Started).await?;
        Ok((session, progress))
    }

    /// Block sizes, start point and priority mode for a strategy.
    fn plan_for(&self, strategy: LoadStrategy) -> (AssemblerConfig, StartPoint, bool) {
        let base = self.settings.assembler;
        match strategy {
            LoadStrategy::Instant => (base, StartPoint::FirstBlock, true),
            LoadStrategy::Progressive => (
                AssemblerConfig {
                    first_playable_bytes: base.storage_block_bytes,
                    ..base
                },
                StartPoint::FirstBlock,
                false,
            ),
            LoadStrategy::Standard => (base, StartPoint::Complete, false),
        }
    }

    /// Play a fully cached track. Any cache problem means "not cached".
    async fn play_from_cache(
        &self,
        track: &Arc<str>,
        callbacks: &PlayCallbacks,
    ) -> Option<PlaybackStart> {
        let store = self.store.as_ref()?;
        let record = match store.get_track(track).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(track_id = %track, error = %err, "cache lookup failed");
                return None;
            }
        };
        let total = record.total_block_count;
        let indices = match store.list_block_indices(track).await {
            Ok(indices) => indices,
            Err(err) => {
                tracing::warn!(track_id = %track, error = %err, "cache listing failed");
                return None;
            }
        };
        let complete = total > 0
            && indices.len() == total as usize
            && indices.iter().enumerate().all(|(i, index)| *index == i as u32);
        if !complete {
            tracing::debug!(track_id = %track, stored = indices.len(), total, "cache incomplete");
            return None;
        }

        let mut channels = vec![Vec::new(); record.channel_count as usize];
        for index in indices {
            let block = match store.get_block(track, index).await {
                Ok(Some(block)) => block,
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(track_id = %track, index, error = %err, "cached block unreadable");
                    return None;
                }
            };
            if block.sample_rate != record.sample_rate || block.channel_count() != channels.len() {
                tracing::warn!(track_id = %track, index, "cached block format mismatch");
                return None;
            }
            for (dst, src) in channels.iter_mut().zip(block.channel_payloads) {
                dst.extend_from_slice(&src);
            }
        }

        let from = record.sample_rate;
        let to = self.output.sample_rate();
        let rendered = tokio::task::spawn_blocking(move || {
            audio_player::resample::resample_planar(channels, from, if to == 0 { from } else { to })
        })
        .await;
        let rendered = match rendered {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(err)) => {
                tracing::warn!(track_id = %track, error = %err, "cached audio not resampled");
                return None;
            }
            Err(err) => {
                tracing::warn!(track_id = %track, error = %err, "cache resample task failed");
                return None;
            }
        };
        let rate = if to == 0 { from } else { to };
        let buffer = Arc::new(PcmBuffer::new(track.clone(), total - 1, rate, rendered));
        let buffered_seconds = buffer.duration_seconds();
        if let Err(err) = self.engine.set_buffer(buffer, None).and_then(|_| self.engine.play()) {
            tracing::warn!(track_id = %track, error = %err, "engine refused cached buffer");
            return None;
        }
        if let Err(err) = store.touch_track(track).await {
            tracing::warn!(track_id = %track, error = %err, "cache touch failed");
        }
        tracing::info!(track_id = %track, blocks = total, duration_s = buffered_seconds, "playing from cache");
        callbacks.fully_loaded(&LoadSummary {
            track_id: track.to_string(),
            blocks: total,
            bytes: record.file_size_bytes,
            duration_seconds: buffered_seconds,
            from_cache: true,
        });
        Some(PlaybackStart {
            track_id: track.to_string(),
            strategy: LoadStrategy::Instant,
            source: LoadSource::Cache,
            buffered_seconds,
            loading: false,
        })
    }

    fn replace_current(&self, next: ActiveLoad) {
        if let Some(previous) = self.lock_current().replace(next) {
            tracing::debug!(track_id = %previous.track_id, "cancelling previous request");
            previous.cancel.cancel();
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<ActiveLoad>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        if let Some(active) = self.lock_current().take() {
            active.cancel.cancel();
        }
    }
}

fn no_playable(track_id: &str, err: PlaybackError) -> PlaybackError {
    match err {
        PlaybackError::Cancelled | PlaybackError::NoPlayableBlock { .. } => err,
        other => PlaybackError::NoPlayableBlock {
            track_id: track_id.to_string(),
            reason: other.to_string(),
        },
    }
}
