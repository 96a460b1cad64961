//! The audio context the player renders for.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::Result;
use audio_player::OutputHost;

/// Where rendered buffers end up. Decoded audio is resampled to [`sample_rate`].
///
/// [`sample_rate`]: AudioOutput::sample_rate
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Rebuild the underlying stream after a fault or a rate change.
    fn reset(&self) -> Result<()>;
}

impl AudioOutput for OutputHost {
    fn sample_rate(&self) -> u32 {
        OutputHost::sample_rate(self)
    }

    fn reset(&self) -> Result<()> {
        OutputHost::reset(self)
    }
}

/// Output without a device, for driving the engine by hand.
#[derive(Debug, Default)]
pub struct DetachedOutput {
    sample_rate: AtomicU32,
    resets: AtomicUsize,
}

impl DetachedOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }
}

impl AudioOutput for DetachedOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
