//! One load session: ordered fragments in, playable buffers and stored blocks out.
//!
//! Assembled blocks are pushed into a [`StreamDecoder`] as they arrive, so each byte is
//! decoded once. The frames a block makes decodable are resampled once and appended to the
//! rendered track. The engine receives the growing track as partial buffers in
//! non-decreasing block order, then a complete buffer and end of stream once the download
//! is done. The same frames, at the source rate, are persisted as that block's
//! [`StoredBlock`]. A cancelled session delivers nothing.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use audio_player::{
    DecodeError, DecodeProgress, EngineHandle, PcmBuffer, StreamDecoder, StreamFormat,
    StreamResampler,
};
use audio_stream_types::{AssembledBlock, DownloadFragment, StoredBlock, TrackRecord};
use chunk_store::{ChunkStore, StoreError};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use range_fetch::{AssemblerConfig, AssemblerEvent, BlockAssembler, FetchError, FragmentStream};
use tokio_util::sync::CancellationToken;

use crate::error::PlaybackError;
use crate::output::AudioOutput;
use crate::player::LoadSource;
use crate::progress::{ChunkProgress, LoadSummary, PlayCallbacks};

/// Blocks in a row that may decode to nothing before any audio has been found.
const MAX_DECODE_WIDENINGS: u32 = 3;

/// Identity of a playback request.
#[derive(Debug)]
pub(crate) struct LoadRequest {
    pub track_id: Arc<str>,
    pub display_name: String,
    pub url: String,
    /// Container hint for the decoder.
    pub extension: Option<String>,
}

/// Collaborators shared by every session of one request.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub request: Arc<LoadRequest>,
    pub engine: EngineHandle,
    pub store: Option<ChunkStore>,
    pub output: Arc<dyn AudioOutput>,
    pub callbacks: PlayCallbacks,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartPoint {
    /// Play as soon as the first block decodes.
    FirstBlock,
    /// Play once the whole file is assembled.
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    Started,
    Finished,
}

/// Whole-file download raced against a first range fragment that misses its deadline.
pub(crate) struct SingleStreamFallback {
    pub after: Duration,
    pub open: BoxFuture<'static, Result<(Option<u64>, FragmentStream), FetchError>>,
}

pub(crate) struct LoadSession {
    fragments: FragmentStream,
    assembler: BlockAssembler,
    assembler_config: AssemblerConfig,
    source: LoadSource,
    fallback: Option<SingleStreamFallback>,
    fragments_seen: u64,
    finished: bool,
    sink: BlockSink,
}

impl LoadSession {
    pub(crate) fn new(
        ctx: SessionContext,
        fragments: FragmentStream,
        total_bytes: Option<u64>,
        assembler: AssemblerConfig,
        start: StartPoint,
        source: LoadSource,
    ) -> Self {
        let mut blocks = BlockAssembler::new(assembler);
        blocks.begin(total_bytes);
        let expected_blocks = total_bytes.map(|total| expected_block_count(total, &assembler));
        Self {
            fragments,
            assembler: blocks,
            assembler_config: assembler,
            source,
            fallback: None,
            fragments_seen: 0,
            finished: false,
            sink: BlockSink::new(ctx, total_bytes, expected_blocks, start),
        }
    }

    /// Race `fallback` against the first fragment once it is `fallback.after` late.
    pub(crate) fn with_fallback(mut self, fallback: SingleStreamFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Transport currently carrying the download.
    pub(crate) fn source(&self) -> LoadSource {
        self.source
    }

    pub(crate) fn duration_seconds(&self) -> f64 {
        self.sink.last_duration
    }

    /// Drive the download until `until` is reached.
    ///
    /// `Progress::Started` returns as soon as audio is playing; the session can then be
    /// driven again to the end.
    pub(crate) async fn run(&mut self, until: Progress) -> Result<Progress, PlaybackError> {
        loop {
            if self.finished {
                return Ok(Progress::Finished);
            }
            if until == Progress::Started && self.sink.started {
                return Ok(Progress::Started);
            }
            if self.sink.ctx.cancel.is_cancelled() {
                self.assembler.abort();
                return Err(PlaybackError::Cancelled);
            }
            if self.sink.halted() {
                // Nothing more can be decoded; the rest of the file is not worth fetching.
                self.assembler.abort();
                self.fragments = stream::empty().boxed();
                self.sink.finish().await?;
                self.finished = true;
                continue;
            }
            match self.next_fragment().await? {
                Some(fragment) => {
                    let events = self.assembler.add_fragment(fragment)?;
                    self.handle(events).await?;
                }
                None => {
                    // take_until ends the stream quietly on cancellation.
                    if self.sink.ctx.cancel.is_cancelled() {
                        self.assembler.abort();
                        return Err(PlaybackError::Cancelled);
                    }
                    let events = self.assembler.finalize()?;
                    self.handle(events).await?;
                    self.sink.finish().await?;
                    self.finished = true;
                }
            }
        }
    }

    async fn next_fragment(&mut self) -> Result<Option<DownloadFragment>, PlaybackError> {
        let item = match self.fallback.take() {
            Some(fallback) if self.fragments_seen == 0 => {
                self.first_fragment_or_fallback(fallback).await
            }
            _ => self.fragments.next().await,
        };
        match item {
            Some(Ok(fragment)) => {
                self.fragments_seen += 1;
                Ok(Some(fragment))
            }
            Some(Err(FetchError::Cancelled)) => Err(PlaybackError::Cancelled),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    /// Wait for the first range fragment. Once it is late, a whole-file stream races it and
    /// whichever produces a fragment first carries the rest of the load.
    async fn first_fragment_or_fallback(
        &mut self,
        fallback: SingleStreamFallback,
    ) -> Option<Result<DownloadFragment, FetchError>> {
        let SingleStreamFallback { after, open } = fallback;
        if let Ok(item) = tokio::time::timeout(after, self.fragments.next()).await {
            return item;
        }
        let track_id = self.sink.ctx.request.track_id.clone();
        tracing::warn!(
            %track_id,
            waited_ms = after.as_millis() as u64,
            "first range fragment is late; racing a single stream"
        );

        let url = self.sink.ctx.request.url.clone();
        let single = async move {
            let (total, mut fragments) = open.await?;
            match fragments.next().await {
                Some(Ok(first)) => Ok((total, fragments, first)),
                Some(Err(err)) => Err(err),
                None => Err(FetchError::Transport {
                    url,
                    message: "empty response body".to_string(),
                }),
            }
        };
        tokio::pin!(single);
        let mut single_failed = false;
        loop {
            tokio::select! {
                item = self.fragments.next() => return item,
                outcome = &mut single, if !single_failed => match outcome {
                    Ok((total, fragments, first)) => {
                        tracing::info!(%track_id, size = ?total, "single stream won the first-block race");
                        self.switch_to_single_stream(total, fragments);
                        return Some(Ok(first));
                    }
                    Err(err) => {
                        tracing::warn!(%track_id, error = %err, "single stream failed; still waiting for ranges");
                        single_failed = true;
                    }
                },
            }
        }
    }

    fn switch_to_single_stream(&mut self, total: Option<u64>, fragments: FragmentStream) {
        self.fragments = fragments;
        self.assembler = BlockAssembler::new(self.assembler_config);
        self.assembler.begin(total);
        self.source = LoadSource::SingleStream;
        self.sink.total_bytes = total;
        self.sink.expected_blocks =
            total.map(|total| expected_block_count(total, &self.assembler_config));
    }

    async fn handle(&mut self, events: Vec<AssemblerEvent>) -> Result<(), PlaybackError> {
        for event in events {
            match event {
                AssemblerEvent::Block(block) => self.sink.on_block(block).await?,
                AssemblerEvent::PlaybackReady => tracing::debug!(
                    track_id = %self.sink.ctx.request.track_id,
                    "first playable block sealed"
                ),
            }
        }
        Ok(())
    }
}

/// Decoder and resampler for one session. Moved onto a blocking thread for each step.
struct Pipeline {
    decoder: StreamDecoder,
    resampler: Option<StreamResampler>,
    /// Output rate; zero follows the source.
    render_rate: u32,
}

/// What one decode step produced.
#[derive(Default)]
struct Step {
    format: Option<StreamFormat>,
    /// New frames at the source rate.
    decoded: Vec<Vec<f32>>,
    /// New frames at the output rate.
    rendered: Vec<Vec<f32>>,
    render_rate: u32,
    /// Failure after the frames above.
    error: Option<DecodeError>,
}

impl Step {
    fn frames(&self) -> usize {
        self.decoded.first().map(Vec::len).unwrap_or(0)
    }
}

impl Pipeline {
    /// Decode what has been pushed; with `drain`, everything up to the closed end.
    fn step(&mut self, drain: bool) -> Step {
        let mut step = Step::default();
        loop {
            let progress = match self.decoder.settle() {
                Ok(progress) => progress,
                Err(err) => {
                    step.error = Some(err);
                    return step;
                }
            };
            let finished = progress.finished;
            if let Err(err) = self.absorb(progress, &mut step) {
                step.error = Some(err);
                return step;
            }
            if finished {
                if let Some(resampler) = self.resampler.as_mut() {
                    match resampler.flush() {
                        Ok(tail) => append(&mut step.rendered, tail),
                        Err(err) => step.error = Some(err),
                    }
                }
                return step;
            }
            if !drain {
                return step;
            }
        }
    }

    fn absorb(&mut self, progress: DecodeProgress, step: &mut Step) -> Result<(), DecodeError> {
        let Some(format) = progress.format.clone() else {
            return Ok(());
        };
        let render_rate = if self.render_rate == 0 {
            format.sample_rate
        } else {
            self.render_rate
        };
        if self.resampler.is_none() {
            self.resampler = Some(StreamResampler::new(
                format.channels,
                format.sample_rate,
                render_rate,
            )?);
        }
        step.render_rate = render_rate;
        step.format = Some(format);
        let (Some(resampler), true) = (self.resampler.as_mut(), progress.frames() > 0) else {
            return Ok(());
        };
        let rendered = resampler.process(progress.channels.clone())?;
        append(&mut step.decoded, progress.channels);
        append(&mut step.rendered, rendered);
        Ok(())
    }
}

fn append(dst: &mut Vec<Vec<f32>>, src: Vec<Vec<f32>>) {
    if dst.is_empty() {
        *dst = src;
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        d.extend(s);
    }
}

struct BlockSink {
    ctx: SessionContext,
    /// Cleared after the first failed write; playback carries on uncached.
    store: Option<ChunkStore>,
    start: StartPoint,
    total_bytes: Option<u64>,
    expected_blocks: Option<u32>,
    loaded_bytes: u64,
    blocks_seen: u32,
    /// Present while decoding; taken for the duration of each step.
    pipeline: Option<Pipeline>,
    /// A decode failure ended the pipeline after audio was found.
    decode_stopped: bool,
    format: Option<StreamFormat>,
    render_rate: u32,
    /// Source frames decoded so far.
    decoded_frames: usize,
    /// Everything decoded so far at the output rate.
    rendered: Vec<Vec<f32>>,
    /// Blocks waiting to be persisted. The newest is held back until the next block
    /// arrives, so frames that only decode at the end of the file still land in it.
    unsaved: Vec<(u32, Vec<Vec<f32>>)>,
    record_written: bool,
    failed_decodes: u32,
    delivered: Option<u32>,
    last_duration: f64,
    started: bool,
}

impl BlockSink {
    fn new(
        ctx: SessionContext,
        total_bytes: Option<u64>,
        expected_blocks: Option<u32>,
        start: StartPoint,
    ) -> Self {
        Self {
            store: ctx.store.clone(),
            ctx,
            start,
            total_bytes,
            expected_blocks,
            loaded_bytes: 0,
            blocks_seen: 0,
            pipeline: None,
            decode_stopped: false,
            format: None,
            render_rate: 0,
            decoded_frames: 0,
            rendered: Vec::new(),
            unsaved: Vec::new(),
            record_written: false,
            failed_decodes: 0,
            delivered: None,
            last_duration: 0.0,
            started: false,
        }
    }

    /// Decoding failed part way; the session should wrap up with what it has.
    fn halted(&self) -> bool {
        self.decode_stopped
    }

    async fn on_block(&mut self, block: AssembledBlock) -> Result<(), PlaybackError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(PlaybackError::Cancelled);
        }
        let index = block.storage_index;
        self.loaded_bytes += block.payload.len() as u64;
        self.blocks_seen = index + 1;
        tracing::debug!(
            track_id = %self.ctx.request.track_id,
            index,
            bytes = block.total_bytes,
            fragments = block.source_fragments.len(),
            "block assembled"
        );
        self.ctx.callbacks.chunk_loaded(&ChunkProgress {
            track_id: self.ctx.request.track_id.to_string(),
            block_index: index,
            block_bytes: block.total_bytes,
            loaded_bytes: self.loaded_bytes,
            total_bytes: self.total_bytes,
        });
        if self.decode_stopped {
            return Ok(());
        }

        if self.pipeline.is_none() {
            self.pipeline = Some(Pipeline {
                decoder: StreamDecoder::spawn(self.ctx.request.extension.as_deref())?,
                resampler: None,
                render_rate: self.ctx.output.sample_rate(),
            });
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.decoder.push(block.payload);
        }
        let step = self.run_pipeline(false).await?;
        let decoded_before = self.decoded_frames;
        self.absorb(index, step).await?;
        if self.start == StartPoint::FirstBlock && self.decoded_frames > decoded_before {
            self.deliver(index, false)?;
        }
        Ok(())
    }

    async fn run_pipeline(&mut self, drain: bool) -> Result<Step, PlaybackError> {
        let Some(mut pipeline) = self.pipeline.take() else {
            return Ok(Step::default());
        };
        let (pipeline, step) = tokio::task::spawn_blocking(move || {
            let step = pipeline.step(drain);
            (pipeline, step)
        })
        .await
        .map_err(|err| PlaybackError::Task(err.to_string()))?;
        self.pipeline = Some(pipeline);
        Ok(step)
    }

    /// Account for one step's frames, attributed to block `index`.
    async fn absorb(&mut self, index: u32, step: Step) -> Result<(), PlaybackError> {
        let frames = step.frames();
        if step.format.is_some() {
            self.format = step.format.clone();
            self.render_rate = step.render_rate;
        }
        let Step {
            decoded,
            rendered,
            error,
            ..
        } = step;

        match self.unsaved.last_mut() {
            Some((last, held)) if *last == index => append(held, decoded),
            _ => self.unsaved.push((index, decoded)),
        }
        if frames > 0 {
            self.failed_decodes = 0;
            self.decoded_frames += frames;
            append(&mut self.rendered, rendered);
        }
        self.persist_settled().await;

        if let Some(err) = error {
            return self.decode_failed(index, err).await;
        }
        if frames == 0 && self.decoded_frames == 0 {
            self.failed_decodes += 1;
            if self.failed_decodes > MAX_DECODE_WIDENINGS {
                return Err(DecodeError::Empty.into());
            }
            tracing::debug!(
                track_id = %self.ctx.request.track_id,
                index,
                attempt = self.failed_decodes,
                "no audio decodable yet; widening"
            );
        }
        Ok(())
    }

    async fn decode_failed(&mut self, index: u32, err: DecodeError) -> Result<(), PlaybackError> {
        if self.decoded_frames == 0 {
            return Err(err.into());
        }
        tracing::warn!(
            track_id = %self.ctx.request.track_id,
            index,
            error = %err,
            "decode failed part way; keeping what is buffered"
        );
        self.pipeline = None;
        self.decode_stopped = true;
        self.drop_cached_track().await;
        Ok(())
    }

    fn deliver(&mut self, index: u32, complete: bool) -> Result<(), PlaybackError> {
        let track_id = self.ctx.request.track_id.clone();
        if self.ctx.cancel.is_cancelled() {
            tracing::debug!(%track_id, index, "dropping block from superseded request");
            return Ok(());
        }
        if self
            .delivered
            .is_some_and(|last| index < last || (index == last && !complete))
        {
            return Ok(());
        }
        let mut buffer = PcmBuffer::new(
            track_id.clone(),
            index,
            self.render_rate,
            self.rendered.clone(),
        );
        if !complete {
            buffer = buffer.partial();
        }
        let buffer = Arc::new(buffer);
        let duration = buffer.duration_seconds();
        if self.started {
            self.ctx.engine.replace_buffer(buffer, None)?;
        } else {
            self.ctx.engine.set_buffer(buffer, None)?;
            self.ctx.engine.play()?;
            self.started = true;
            tracing::info!(%track_id, index, duration_s = duration, "playback started");
        }
        self.delivered = Some(index);
        self.last_duration = duration;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), PlaybackError> {
        if let Some(pipeline) = &self.pipeline {
            pipeline.decoder.close();
            let step = self.run_pipeline(true).await?;
            self.pipeline = None;
            let last = self.blocks_seen.saturating_sub(1);
            self.absorb(last, step).await?;
        }

        let track_id = self.ctx.request.track_id.to_string();
        let Some(format) = self.format.clone().filter(|_| self.decoded_frames > 0) else {
            return Err(PlaybackError::NoPlayableBlock {
                track_id,
                reason: "download ended before any audio decoded".to_string(),
            });
        };
        // After a failure the engine already holds everything that decoded.
        if !(self.decode_stopped && self.started) {
            self.deliver(self.blocks_seen.saturating_sub(1), true)?;
        }
        if !self.ctx.cancel.is_cancelled() {
            self.ctx.engine.end_of_stream()?;
        }

        for (index, channels) in std::mem::take(&mut self.unsaved) {
            self.persist(index, channels).await;
        }
        let duration = self.decoded_frames as f64 / format.sample_rate.max(1) as f64;
        if self.record_written
            && let Some(store) = self.store.clone()
        {
            let record = self.track_record(&format, self.blocks_seen, duration);
            if let Err(err) = store.put_track(&record).await {
                self.disable_cache(err);
            }
        }
        tracing::info!(
            %track_id,
            blocks = self.blocks_seen,
            bytes = self.loaded_bytes,
            duration_s = duration,
            "track fully loaded"
        );
        self.ctx.callbacks.fully_loaded(&LoadSummary {
            track_id,
            blocks: self.blocks_seen,
            bytes: self.loaded_bytes,
            duration_seconds: duration,
            from_cache: false,
        });
        Ok(())
    }

    /// Write every held block except the newest, once the format is known.
    async fn persist_settled(&mut self) {
        if self.format.is_none() || self.unsaved.len() < 2 {
            return;
        }
        let newest = self.unsaved.split_off(self.unsaved.len() - 1);
        for (index, channels) in std::mem::replace(&mut self.unsaved, newest) {
            self.persist(index, channels).await;
        }
    }

    async fn persist(&mut self, index: u32, mut channels: Vec<Vec<f32>>) {
        let (Some(store), Some(format)) = (self.store.clone(), self.format.clone()) else {
            return;
        };
        if !self.record_written {
            let duration = format.track_duration_seconds.unwrap_or_else(|| {
                self.decoded_frames as f64 / format.sample_rate.max(1) as f64
            });
            let record = self.track_record(&format, self.expected_blocks.unwrap_or(0), duration);
            if let Err(err) = store.put_track(&record).await {
                return self.disable_cache(err);
            }
            self.record_written = true;
        }

        channels.resize(format.channels, Vec::new());
        let block = StoredBlock {
            track_id: self.ctx.request.track_id.to_string(),
            block_index: index,
            sample_rate: format.sample_rate,
            sample_count: channels.first().map(|ch| ch.len() as u64).unwrap_or(0),
            channel_payloads: channels,
        };
        if let Err(err) = store.put_block(&block).await {
            self.disable_cache(err);
        }
    }

    /// A track that stopped decoding part way must not look cached.
    async fn drop_cached_track(&mut self) {
        self.unsaved.clear();
        let Some(store) = self.store.take() else {
            return;
        };
        if self.record_written
            && let Err(err) = store.delete_track(&self.ctx.request.track_id).await
        {
            tracing::warn!(
                track_id = %self.ctx.request.track_id,
                error = %err,
                "partial track not removed from cache"
            );
        }
    }

    fn disable_cache(&mut self, err: StoreError) {
        tracing::warn!(
            track_id = %self.ctx.request.track_id,
            error = %err,
            "cache write failed; playing without caching"
        );
        self.store = None;
    }

    fn track_record(
        &self,
        format: &StreamFormat,
        total_block_count: u32,
        duration_seconds: f64,
    ) -> TrackRecord {
        let request = &self.ctx.request;
        TrackRecord {
            track_id: request.track_id.to_string(),
            display_name: request.display_name.clone(),
            duration_seconds,
            sample_rate: format.sample_rate,
            channel_count: format.channels as u16,
            total_block_count,
            source_url: request.url.clone(),
            file_size_bytes: self.total_bytes.unwrap_or(self.loaded_bytes),
            last_accessed_at_ms: now_ms(),
        }
    }
}

/// Number of blocks the assembler cuts a `total`-byte file into.
pub(crate) fn expected_block_count(total: u64, config: &AssemblerConfig) -> u32 {
    let first = config.first_playable_bytes.max(1);
    let storage = config.storage_block_bytes.max(1);
    if total <= first {
        return 1;
    }
    (1 + (total - first).div_ceil(storage)) as u32
}

/// Container hint from the URL path, then the content type.
pub(crate) fn extension_hint(url: &str, content_type: Option<&str>) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    if let Some((_, ext)) = file.rsplit_once('.')
        && !ext.is_empty()
        && ext.len() <= 5
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Some(ext.to_ascii_lowercase());
    }
    let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/aac" => "aac",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/ogg" | "audio/vorbis" => "ogg",
        "audio/aiff" | "audio/x-aiff" => "aiff",
        _ => return None,
    };
    Some(ext.to_string())
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_player::decode::wav_bytes;
    use audio_player::{EngineConfig, EngineEvent, RenderEngine, engine};
    use audio_stream_types::EngineState;
    use bytes::Bytes;

    use crate::output::DetachedOutput;

    const KIB: u64 = 1024;
    const RATE: u32 = 8_000;

    fn context(engine: EngineHandle, output_rate: u32) -> SessionContext {
        SessionContext {
            request: Arc::new(LoadRequest {
                track_id: Arc::from("song"),
                display_name: "Song".to_string(),
                url: "http://127.0.0.1:9/song.wav".to_string(),
                extension: Some("wav".to_string()),
            }),
            engine,
            store: None,
            output: Arc::new(DetachedOutput::new(output_rate)),
            callbacks: PlayCallbacks::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn block(index: u32, payload: &[u8]) -> AssembledBlock {
        AssembledBlock {
            storage_index: index,
            source_fragments: vec![index as u64],
            total_bytes: payload.len() as u64,
            payload: Bytes::copy_from_slice(payload),
            is_first_playable: index == 0,
        }
    }

    fn render(engine: &mut RenderEngine, frames: usize) {
        let mut out = vec![0.0f32; frames * 2];
        engine.render(&mut out, 2);
    }

    fn ended(handle: &EngineHandle) -> usize {
        handle
            .try_events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Ended { .. }))
            .count()
    }

    #[test]
    fn expected_blocks_match_assembler_cuts() {
        let cfg = AssemblerConfig {
            first_playable_bytes: 256 * KIB,
            storage_block_bytes: 2048 * KIB,
        };
        assert_eq!(expected_block_count(100, &cfg), 1);
        assert_eq!(expected_block_count(256 * KIB, &cfg), 1);
        assert_eq!(expected_block_count(256 * KIB + 1, &cfg), 2);
        assert_eq!(expected_block_count(10 * 1024 * KIB, &cfg), 6);
        assert_eq!(expected_block_count(256 * KIB + 4096 * KIB, &cfg), 3);
    }

    #[test]
    fn extension_comes_from_path_then_mime() {
        assert_eq!(
            extension_hint("https://cdn.test/a/Track.MP3?sig=1", None).as_deref(),
            Some("mp3")
        );
        assert_eq!(
            extension_hint("https://cdn.test/stream/42", Some("audio/flac; q=1")).as_deref(),
            Some("flac")
        );
        assert_eq!(extension_hint("https://cdn.test/stream/42", None), None);
        assert_eq!(
            extension_hint("https://cdn.test/stream/42", Some("text/html")),
            None
        );
    }

    #[tokio::test]
    async fn blocks_grow_one_partial_buffer_then_end_once() {
        let (handle, mut engine) = engine::channel(&EngineConfig::default());
        let mut sink = BlockSink::new(
            context(handle.clone(), RATE),
            None,
            None,
            StartPoint::FirstBlock,
        );
        let wav = wav_bytes(RATE, 2, RATE as usize);
        let third = wav.len() / 3;

        sink.on_block(block(0, &wav[..third])).await.expect("block 0");
        assert!(sink.started);
        let first = sink.decoded_frames;
        assert!(first > 0 && first < RATE as usize / 3);

        sink.on_block(block(1, &wav[third..2 * third])).await.expect("block 1");
        sink.on_block(block(2, &wav[2 * third..])).await.expect("block 2");
        sink.finish().await.expect("finish");
        assert_eq!(sink.decoded_frames, RATE as usize);
        assert_eq!(sink.rendered[0].len(), RATE as usize);

        for _ in 0..10 {
            render(&mut engine, 1_024);
        }
        let snapshot = handle.position();
        assert_eq!(snapshot.buffer_index, 2);
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(ended(&handle), 1);
    }

    #[tokio::test]
    async fn rendered_audio_follows_the_output_rate() {
        let (handle, _engine) = engine::channel(&EngineConfig::default());
        let mut sink = BlockSink::new(context(handle, 16_000), None, None, StartPoint::Complete);
        let wav = wav_bytes(RATE, 1, RATE as usize);
        sink.on_block(block(0, &wav[..wav.len() / 2])).await.expect("block 0");
        assert!(!sink.started);
        sink.on_block(block(1, &wav[wav.len() / 2..])).await.expect("block 1");
        sink.finish().await.expect("finish");

        assert!(sink.started);
        assert_eq!(sink.render_rate, 16_000);
        assert_eq!(sink.decoded_frames, RATE as usize);
        assert_eq!(sink.rendered[0].len(), 2 * RATE as usize);
        assert!((sink.last_duration - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn decode_failure_after_start_keeps_the_playing_buffer() {
        let (handle, mut engine) = engine::channel(&EngineConfig::default());
        let mut sink = BlockSink::new(
            context(handle.clone(), RATE),
            None,
            None,
            StartPoint::FirstBlock,
        );
        let wav = wav_bytes(RATE, 2, RATE as usize);
        let half = wav.len() / 2;
        sink.on_block(block(0, &wav[..half])).await.expect("block 0");
        let playing = sink.decoded_frames;
        render(&mut engine, 256);
        assert_eq!(handle.position().state, EngineState::Rendering);

        let failure = Step {
            error: Some(DecodeError::Stream("corrupt frame header".to_string())),
            ..Step::default()
        };
        sink.absorb(1, failure)
            .await
            .expect("failure after start is not fatal");
        assert!(sink.halted());

        sink.on_block(block(1, &wav[half..])).await.expect("block 1");
        assert_eq!(sink.decoded_frames, playing);
        sink.finish().await.expect("finish");

        for _ in 0..10 {
            render(&mut engine, 1_024);
        }
        let snapshot = handle.position();
        assert_eq!(snapshot.buffer_index, 0);
        assert!((snapshot.duration_seconds - playing as f64 / RATE as f64).abs() < 1e-9);
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(ended(&handle), 1);
    }

    #[tokio::test]
    async fn decode_failure_before_any_audio_is_fatal() {
        let (handle, _engine) = engine::channel(&EngineConfig::default());
        let mut sink = BlockSink::new(context(handle, RATE), None, None, StartPoint::FirstBlock);
        let failure = Step {
            error: Some(DecodeError::Unsupported("no format".to_string())),
            ..Step::default()
        };
        let err = sink.absorb(0, failure).await.expect_err("nothing decoded");
        assert!(matches!(
            err,
            PlaybackError::Decode(DecodeError::Unsupported(_))
        ));
    }
}
