use std::sync::Arc;

/// Planar PCM handed to the render engine.
///
/// Immutable once built; the engine shares it by `Arc` and returns it for dropping
/// off the real-time thread when it is displaced.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub track_id: Arc<str>,
    /// Highest assembled block index this buffer covers.
    pub block_index: u32,
    pub sample_rate: u32,
    channels: Vec<Vec<f32>>,
    /// Whether this buffer reaches the end of the track.
    complete: bool,
}

impl PcmBuffer {
    /// Channels are truncated to the shortest one.
    pub fn new(
        track_id: impl Into<Arc<str>>,
        block_index: u32,
        sample_rate: u32,
        mut channels: Vec<Vec<f32>>,
    ) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for ch in &mut channels {
            ch.truncate(frames);
        }
        Self {
            track_id: track_id.into(),
            block_index,
            sample_rate: sample_rate.max(1),
            channels,
            complete: true,
        }
    }

    /// Mark the buffer as a prefix that later buffers will extend.
    ///
    /// Running off the end of a partial buffer starves the engine instead of ending playback.
    pub fn partial(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample for output channel `dst_ch` of a `dst_channels`-wide frame.
    ///
    /// Mono is duplicated, stereo is averaged down to mono, other layouts clamp to the
    /// last available source channel.
    #[inline]
    pub(crate) fn mapped_sample(&self, frame: usize, dst_channels: usize, dst_ch: usize) -> f32 {
        let src = &self.channels;
        let get = |ch: usize| src.get(ch).and_then(|c| c.get(frame)).copied().unwrap_or(0.0);
        match (src.len(), dst_channels) {
            (0, _) => 0.0,
            (2, 1) => 0.5 * (get(0) + get(1)),
            (1, _) => get(0),
            (n, _) => get(dst_ch.min(n - 1)),
        }
    }
}
