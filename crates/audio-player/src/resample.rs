//! Sample-rate conversion of decoded audio.
//!
//! [`StreamResampler`] keeps Rubato's sinc filter state across calls, so audio that arrives
//! in pieces is converted once, piece by piece. The filter delay is trimmed from the front
//! and the tail is flushed with silence, so output frame `n` lines up with input time
//! `n / to_rate` and the total length is `round(input_frames * ratio)`.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::DecodeError;

const CHUNK_FRAMES: usize = 1024;

/// Incremental planar resampler.
pub struct StreamResampler {
    channel_count: usize,
    ratio: f64,
    /// `None` when the rates already match.
    inner: Option<Async<f32>>,
    /// Interleaved input not yet filling a whole chunk.
    carry: Vec<f32>,
    out_chunk: Vec<f32>,
    delay_left: usize,
    input_frames: u64,
    emitted: u64,
}

impl StreamResampler {
    pub fn new(channel_count: usize, from_rate: u32, to_rate: u32) -> Result<Self, DecodeError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(DecodeError::Resample(format!(
                "invalid rates {from_rate} -> {to_rate}"
            )));
        }
        let channel_count = channel_count.max(1);
        let ratio = to_rate as f64 / from_rate as f64;
        if from_rate == to_rate {
            return Ok(Self {
                channel_count,
                ratio,
                inner: None,
                carry: Vec::new(),
                out_chunk: Vec::new(),
                delay_left: 0,
                input_frames: 0,
                emitted: 0,
            });
        }

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            channel_count,
            FixedAsync::Input,
        )
        .map_err(|err| DecodeError::Resample(err.to_string()))?;

        Ok(Self {
            channel_count,
            ratio,
            delay_left: resampler.output_delay(),
            out_chunk: vec![0.0; resampler.output_frames_max() * channel_count],
            inner: Some(resampler),
            carry: Vec::with_capacity(CHUNK_FRAMES * channel_count),
            input_frames: 0,
            emitted: 0,
        })
    }

    /// Convert the next piece of input. Output lags the input by up to one chunk until
    /// [`flush`](Self::flush).
    pub fn process(&mut self, channels: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, DecodeError> {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        self.input_frames += frames as u64;
        if self.inner.is_none() {
            self.emitted += frames as u64;
            return Ok(channels);
        }

        self.carry.extend(interleave(&channels, frames));
        drop(channels);
        let chunk_len = CHUNK_FRAMES * self.channel_count;
        let whole = self.carry.len() / chunk_len * chunk_len;
        let input = std::mem::take(&mut self.carry);
        let mut produced = Vec::new();
        for chunk in input[..whole].chunks_exact(chunk_len) {
            self.run_chunk(chunk, CHUNK_FRAMES, None, &mut produced)?;
        }
        self.carry = input;
        self.carry.drain(..whole);
        self.emitted += (produced.len() / self.channel_count) as u64;
        Ok(deinterleave(&produced, self.channel_count))
    }

    /// Push the buffered remainder and the filter tail through. Returns the last frames.
    pub fn flush(&mut self) -> Result<Vec<Vec<f32>>, DecodeError> {
        if self.inner.is_none() {
            return Ok(vec![Vec::new(); self.channel_count]);
        }
        let expected = (self.input_frames as f64 * self.ratio).round() as u64;
        let wanted = expected.saturating_sub(self.emitted) as usize;
        let mut produced = Vec::with_capacity((wanted + CHUNK_FRAMES) * self.channel_count);

        let carry = std::mem::take(&mut self.carry);
        let carry_frames = carry.len() / self.channel_count;
        if carry_frames > 0 {
            self.run_chunk(&carry, carry_frames, Some(carry_frames), &mut produced)?;
        }
        let silence = vec![0.0f32; CHUNK_FRAMES * self.channel_count];
        while produced.len() / self.channel_count < wanted {
            self.run_chunk(&silence, CHUNK_FRAMES, None, &mut produced)?;
        }
        produced.truncate(wanted * self.channel_count);
        self.emitted += wanted as u64;
        Ok(deinterleave(&produced, self.channel_count))
    }

    fn run_chunk(
        &mut self,
        input: &[f32],
        frames: usize,
        partial_len: Option<usize>,
        produced: &mut Vec<f32>,
    ) -> Result<(), DecodeError> {
        let channel_count = self.channel_count;
        let Some(resampler) = self.inner.as_mut() else {
            produced.extend_from_slice(input);
            return Ok(());
        };
        let input_adapter = InterleavedSlice::new(input, channel_count, frames)
            .map_err(|err| DecodeError::Resample(err.to_string()))?;
        let out_frames = self.out_chunk.len() / channel_count;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_chunk, channel_count, out_frames)
                .map_err(|err| DecodeError::Resample(err.to_string()))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|err| DecodeError::Resample(err.to_string()))?;

        let skip = self.delay_left.min(nbr_out);
        self.delay_left -= skip;
        produced.extend_from_slice(&self.out_chunk[skip * channel_count..nbr_out * channel_count]);
        Ok(())
    }
}

/// Convert a whole planar buffer from `from_rate` to `to_rate`.
///
/// Returns the input unchanged when the rates already match.
pub fn resample_planar(
    channels: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<Vec<f32>>, DecodeError> {
    let channel_count = channels.len();
    let in_frames = channels.first().map(Vec::len).unwrap_or(0);
    if from_rate == to_rate || channel_count == 0 || in_frames == 0 {
        return Ok(channels);
    }
    let mut resampler = StreamResampler::new(channel_count, from_rate, to_rate)?;
    let mut out = resampler.process(channels)?;
    for (dst, tail) in out.iter_mut().zip(resampler.flush()?) {
        dst.extend(tail);
    }
    Ok(out)
}

fn interleave(channels: &[Vec<f32>], frames: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(frames * channels.len());
    for i in 0..frames {
        for ch in channels {
            out.push(ch.get(i).copied().unwrap_or(0.0));
        }
    }
    out
}

fn deinterleave(samples: &[f32], channel_count: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channel_count;
    let mut out = vec![Vec::with_capacity(frames); channel_count];
    for frame in samples.chunks_exact(channel_count) {
        for (ch, s) in out.iter_mut().zip(frame) {
            ch.push(*s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (i as f32 / rate as f32 * 440.0 * std::f32::consts::TAU).sin() * 0.5)
            .collect()
    }

    #[test]
    fn same_rate_is_passthrough() {
        let input = vec![vec![0.1, 0.2, 0.3]];
        let out = resample_planar(input.clone(), 48_000, 48_000).expect("resample");
        assert_eq!(out, input);
    }

    #[test]
    fn output_length_follows_ratio() {
        let input = vec![sine(44_100, 44_100), sine(44_100, 44_100)];
        let out = resample_planar(input, 44_100, 48_000).expect("resample");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 48_000);
        assert_eq!(out[1].len(), 48_000);
    }

    #[test]
    fn short_input_still_produces_output() {
        let out = resample_planar(vec![sine(8_000, 100)], 8_000, 16_000).expect("resample");
        assert_eq!(out[0].len(), 200);
    }

    #[test]
    fn delay_is_compensated() {
        // A 440 Hz sine upsampled 2x should still start near zero and stay bounded.
        let out = resample_planar(vec![sine(22_050, 22_050)], 22_050, 44_100).expect("resample");
        let peak = out[0].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(out[0][0].abs() < 0.1);
        assert!(peak > 0.4 && peak < 0.6);
    }

    #[test]
    fn zero_rate_is_an_error() {
        assert!(resample_planar(vec![vec![0.0; 4]], 0, 48_000).is_err());
        assert!(StreamResampler::new(2, 44_100, 0).is_err());
    }

    #[test]
    fn pieces_match_one_shot_conversion() {
        let input = sine(22_050, 10_000);
        let whole = resample_planar(vec![input.clone()], 22_050, 48_000).expect("resample");

        let mut stream = StreamResampler::new(1, 22_050, 48_000).expect("resampler");
        let mut pieces = Vec::new();
        for piece in input.chunks(3_333) {
            pieces.extend(stream.process(vec![piece.to_vec()]).expect("process").remove(0));
        }
        pieces.extend(stream.flush().expect("flush").remove(0));

        assert_eq!(pieces.len(), whole[0].len());
        for (a, b) in pieces.iter().zip(&whole[0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn output_never_runs_ahead_of_input() {
        let mut stream = StreamResampler::new(2, 44_100, 48_000).expect("resampler");
        let mut emitted = 0;
        let mut fed = 0;
        for _ in 0..5 {
            let piece = sine(44_100, 2_000);
            fed += piece.len();
            emitted += stream.process(vec![piece.clone(), piece]).expect("process")[0].len();
            assert!(emitted as f64 <= fed as f64 * 48_000.0 / 44_100.0 + 1.0);
        }
        emitted += stream.flush().expect("flush")[0].len();
        assert_eq!(emitted, (fed as f64 * 48_000.0 / 44_100.0).round() as usize);
    }
}
