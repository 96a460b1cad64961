//! Incremental decoding of a byte stream into planar `f32`.
//!
//! [`StreamDecoder`] owns a background thread running Symphonia over a blocking, append-only
//! byte feed. Assembled blocks are pushed in as they arrive; the decoder thread consumes
//! each byte once and keeps its container and codec state between blocks. [`StreamDecoder::settle`]
//! waits until everything decodable from the bytes pushed so far has been decoded and
//! returns the new frames. A packet cut off by the end of the pushed bytes is completed by
//! the next block.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use bytes::Bytes;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::DecodeError;

/// Undecodable packets in a row before the stream is given up on.
const MAX_BAD_PACKETS: u32 = 16;

/// Properties of the decoded track, known once the container header has been read.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: usize,
    /// Full-track duration from the container, when it declares one.
    pub track_duration_seconds: Option<f64>,
    pub codec: Option<String>,
}

/// Frames decoded since the previous [`StreamDecoder::settle`].
#[derive(Clone, Debug, Default)]
pub struct DecodeProgress {
    /// `None` until the header has been parsed.
    pub format: Option<StreamFormat>,
    /// One vector per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
    /// The feed was closed and everything in it has been decoded.
    pub finished: bool,
}

impl DecodeProgress {
    pub fn frames(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }
}

#[derive(Default)]
struct Feed {
    chunks: VecDeque<Bytes>,
    closed: bool,
    abandoned: bool,
    /// The reader is parked waiting for bytes that have not been pushed yet.
    starved: bool,
    /// The decoder thread has exited.
    done: bool,
    error: Option<DecodeError>,
    format: Option<StreamFormat>,
    pending: Vec<Vec<f32>>,
}

type Shared = Arc<(Mutex<Feed>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Feed> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background decoder fed with consecutive byte blocks of one file.
pub struct StreamDecoder {
    shared: Shared,
}

impl StreamDecoder {
    /// Start the decoder thread. `extension` is a container hint (`"mp3"`, `"wav"`, ...).
    pub fn spawn(extension: Option<&str>) -> Result<Self, DecodeError> {
        let shared: Shared = Arc::new((Mutex::new(Feed::default()), Condvar::new()));
        let worker = shared.clone();
        let extension = extension.map(str::to_string);
        thread::Builder::new()
            .name("stream-decode".into())
            .spawn(move || run_worker(worker, extension))
            .map_err(|err| DecodeError::Worker(err.to_string()))?;
        Ok(Self { shared })
    }

    /// Append the next block of the file.
    pub fn push(&self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut feed = lock(&self.shared);
        feed.chunks.push_back(bytes);
        feed.starved = false;
        drop(feed);
        self.shared.1.notify_all();
    }

    /// No more bytes will follow; the decoder drains what it has and stops.
    pub fn close(&self) {
        let mut feed = lock(&self.shared);
        feed.closed = true;
        feed.starved = false;
        drop(feed);
        self.shared.1.notify_all();
    }

    /// Block until the decoder has caught up with every pushed byte, then take the new frames.
    ///
    /// Frames decoded before a failure are returned first; the failure is reported by the
    /// following call.
    pub fn settle(&self) -> Result<DecodeProgress, DecodeError> {
        let mut feed = lock(&self.shared);
        while !feed.done && !(feed.starved && feed.chunks.is_empty()) {
            feed = self
                .shared
                .1
                .wait(feed)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let width = feed.pending.len();
        let channels = std::mem::replace(&mut feed.pending, vec![Vec::new(); width]);
        let progress = DecodeProgress {
            format: feed.format.clone(),
            channels,
            finished: feed.done && feed.error.is_none(),
        };
        if progress.frames() == 0
            && let Some(err) = &feed.error
        {
            return Err(err.clone());
        }
        Ok(progress)
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        lock(&self.shared).abandoned = true;
        self.shared.1.notify_all();
    }
}

fn run_worker(shared: Shared, extension: Option<String>) {
    let result = decode_feed(&shared, extension.as_deref());
    let mut feed = lock(&shared);
    if let Err(err) = result
        && !feed.abandoned
    {
        tracing::debug!(error = %err, "decoder thread stopped");
        feed.error = Some(err);
    }
    feed.done = true;
    drop(feed);
    shared.1.notify_all();
}

/// Probe the feed and decode packets until it ends. Runs on the decoder thread.
fn decode_feed(shared: &Shared, extension: Option<&str>) -> Result<(), DecodeError> {
    let source = FeedReader {
        shared: shared.clone(),
        front: Bytes::new(),
        pos: 0,
    };
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| match err {
            SymphoniaError::IoError(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                DecodeError::Empty
            }
            other => DecodeError::Unsupported(other.to_string()),
        })?;
    let mut format = probed.format;

    let track = format.default_track().ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let codec_params: CodecParameters = track.codec_params.clone();
    let channel_count = codec_params
        .channels
        .map(|c| c.count())
        .ok_or(DecodeError::NoTrack)?;
    let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoTrack)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| DecodeError::Unsupported(err.to_string()))?;

    {
        let mut feed = lock(shared);
        feed.format = Some(StreamFormat {
            sample_rate,
            channels: channel_count,
            track_duration_seconds: duration_from_codec_params(&codec_params),
            codec: codec_name_from_params(&codec_params),
        });
        feed.pending = vec![Vec::new(); channel_count];
    }

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut bad_packets = 0u32;
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            // The feed closed, possibly part way through a packet.
            Err(SymphoniaError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(DecodeError::Stream(err.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(err)) => {
                bad_packets += 1;
                if bad_packets > MAX_BAD_PACKETS {
                    return Err(DecodeError::Stream(format!(
                        "{bad_packets} undecodable packets in a row: {err}"
                    )));
                }
                tracing::debug!(error = err, "skipping undecodable packet");
                continue;
            }
            Err(err) => return Err(DecodeError::Stream(err.to_string())),
        };
        bad_packets = 0;

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if sample_buf
            .as_ref()
            .map(|b| b.capacity() < frames * spec.channels.count())
            .unwrap_or(true)
        {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_planar_ref(decoded);
        let samples = buf.samples();

        let mut feed = lock(shared);
        for (ch, out) in feed.pending.iter_mut().enumerate() {
            let start = ch * frames;
            if let Some(plane) = samples.get(start..start + frames) {
                out.extend_from_slice(plane);
            }
        }
    }
}

/// Blocking reader over the pushed blocks, in order.
///
/// Waits for more bytes instead of reporting end of stream until the feed is closed.
struct FeedReader {
    shared: Shared,
    front: Bytes,
    pos: u64,
}

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.front.is_empty() {
            let mut feed = lock(&self.shared);
            loop {
                if feed.abandoned {
                    return Err(io::Error::other("decoder abandoned"));
                }
                if let Some(next) = feed.chunks.pop_front() {
                    self.front = next;
                    break;
                }
                if feed.closed {
                    return Ok(0);
                }
                feed.starved = true;
                self.shared.1.notify_all();
                feed = self
                    .shared
                    .1
                    .wait(feed)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        let n = buf.len().min(self.front.len());
        buf[..n].copy_from_slice(&self.front.split_to(n));
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FeedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "block feed is not seekable",
            )),
        }
    }
}

impl MediaSource for FeedReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Best-effort container-declared duration.
fn duration_from_codec_params(codec_params: &CodecParameters) -> Option<f64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

/// Best-effort codec label for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

/// 16-bit PCM WAV bytes, used by tests across the workspace.
#[doc(hidden)]
pub fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
    let data_len = frames * channels as usize * 2;
    let mut out = Vec::with_capacity(44 + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let v = ((t * 440.0 * std::f32::consts::TAU).sin() * 0.5 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    fn decode_all(bytes: &[u8], extension: Option<&str>) -> Result<DecodeProgress, DecodeError> {
        let decoder = StreamDecoder::spawn(extension)?;
        decoder.push(Bytes::copy_from_slice(bytes));
        decoder.close();
        let mut all = DecodeProgress::default();
        loop {
            let step = decoder.settle()?;
            if all.channels.is_empty() {
                all.channels = vec![Vec::new(); step.channels.len()];
            }
            for (dst, src) in all.channels.iter_mut().zip(step.channels) {
                dst.extend(src);
            }
            all.format = step.format;
            if step.finished {
                return Ok(all);
            }
        }
    }

    #[test]
    fn decodes_complete_wav() {
        let audio = decode_all(&wav_bytes(8_000, 2, 8_000), Some("wav")).expect("decode");
        let format = audio.format.clone().expect("format");
        assert_eq!(format.sample_rate, 8_000);
        assert_eq!(format.channels, 2);
        assert_eq!(format.track_duration_seconds, Some(1.0));
        assert_eq!(format.codec.as_deref(), Some("PCM_S16"));
        assert_eq!(audio.frames(), 8_000);
        assert_eq!(audio.channels[0], audio.channels[1]);
    }

    #[test]
    fn blocks_decode_as_they_arrive() {
        let wav = wav_bytes(8_000, 1, 8_000);
        let whole = decode_all(&wav, Some("wav")).expect("decode");
        let decoder = StreamDecoder::spawn(Some("wav")).expect("spawn");

        decoder.push(Bytes::copy_from_slice(&wav[..20]));
        let header = decoder.settle().expect("settle header");
        assert!(header.format.is_none());
        assert_eq!(header.frames(), 0);

        decoder.push(Bytes::copy_from_slice(&wav[20..44 + 4_000 * 2]));
        let first = decoder.settle().expect("settle first half");
        assert_eq!(first.format.as_ref().map(|f| f.sample_rate), Some(8_000));
        assert!(first.frames() > 0 && first.frames() <= 4_000);
        assert!(!first.finished);

        decoder.push(Bytes::copy_from_slice(&wav[44 + 4_000 * 2..]));
        decoder.close();
        let rest = decoder.settle().expect("settle rest");
        assert!(rest.finished);
        assert_eq!(first.frames() + rest.frames(), 8_000);

        let mut joined = first.channels[0].clone();
        joined.extend_from_slice(&rest.channels[0]);
        assert_eq!(joined, whole.channels[0]);
    }

    #[test]
    fn truncated_file_keeps_whole_packets() {
        let full = wav_bytes(8_000, 1, 8_000);
        let audio = decode_all(&full[..44 + 4_000 * 2 + 1], Some("wav")).expect("decode");
        assert!(audio.frames() > 0);
        assert!(audio.frames() <= 4_000);
        assert_eq!(
            audio.format.and_then(|f| f.track_duration_seconds),
            Some(1.0)
        );
    }

    #[test]
    fn garbage_is_unsupported() {
        let err = decode_all(&[0u8; 512], None).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported(_)));
    }

    #[test]
    fn header_only_decodes_nothing() {
        let full = wav_bytes(8_000, 1, 100);
        let audio = decode_all(&full[..44], Some("wav")).expect("decode");
        assert!(audio.format.is_some());
        assert_eq!(audio.frames(), 0);
    }

    #[test]
    fn dropping_the_decoder_releases_a_waiting_thread() {
        let decoder = StreamDecoder::spawn(Some("wav")).expect("spawn");
        decoder.push(Bytes::copy_from_slice(&wav_bytes(8_000, 1, 100)[..10]));
        decoder.settle().expect("settle");
        let shared = decoder.shared.clone();
        drop(decoder);
        for _ in 0..200 {
            if lock(&shared).done {
                return;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("decoder thread still parked");
    }

    #[test]
    fn duration_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_from_codec_params(&params).is_none());
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_MP3;
        assert_eq!(codec_name_from_params(&params), Some("MP3".to_string()));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }
}
