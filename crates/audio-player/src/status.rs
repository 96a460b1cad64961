//! Lock-free playback status shared between the render thread and readers.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use audio_stream_types::{EngineState, PositionSnapshot};

/// Counters written by the render thread once per tick and read anywhere.
#[derive(Debug)]
pub struct EngineStatus {
    state: AtomicU8,
    position_bits: AtomicU64,
    duration_bits: AtomicU64,
    buffer_index: AtomicU32,
    volume_bits: AtomicU32,
    underrun_frames: AtomicU64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(state_code(EngineState::Idle)),
            position_bits: AtomicU64::new(0f64.to_bits()),
            duration_bits: AtomicU64::new(0f64.to_bits()),
            buffer_index: AtomicU32::new(0),
            volume_bits: AtomicU32::new(1f32.to_bits()),
            underrun_frames: AtomicU64::new(0),
        }
    }
}

impl EngineStatus {
    pub(crate) fn publish(
        &self,
        state: EngineState,
        position_seconds: f64,
        duration_seconds: f64,
        buffer_index: u32,
        volume: f32,
    ) {
        self.state.store(state_code(state), Ordering::Relaxed);
        self.position_bits
            .store(position_seconds.to_bits(), Ordering::Relaxed);
        self.duration_bits
            .store(duration_seconds.to_bits(), Ordering::Relaxed);
        self.buffer_index.store(buffer_index, Ordering::Relaxed);
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Count frames of silence emitted while a session wanted audio.
    pub fn add_underrun(&self, frames: u64) {
        self.underrun_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            state: state_from_code(self.state.load(Ordering::Relaxed)),
            position_seconds: f64::from_bits(self.position_bits.load(Ordering::Relaxed)),
            duration_seconds: f64::from_bits(self.duration_bits.load(Ordering::Relaxed)),
            buffer_index: self.buffer_index.load(Ordering::Relaxed),
            volume: f32::from_bits(self.volume_bits.load(Ordering::Relaxed)),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
        }
    }
}

fn state_code(state: EngineState) -> u8 {
    match state {
        EngineState::Idle => 0,
        EngineState::Armed => 1,
        EngineState::Rendering => 2,
    }
}

fn state_from_code(code: u8) -> EngineState {
    match code {
        1 => EngineState::Armed,
        2 => EngineState::Rendering,
        _ => EngineState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_published_values() {
        let status = EngineStatus::default();
        status.publish(EngineState::Rendering, 12.5, 180.0, 3, 0.25);
        status.add_underrun(64);
        status.add_underrun(16);

        let snap = status.snapshot();
        assert_eq!(snap.state, EngineState::Rendering);
        assert_eq!(snap.position_seconds, 12.5);
        assert_eq!(snap.duration_seconds, 180.0);
        assert_eq!(snap.buffer_index, 3);
        assert_eq!(snap.volume, 0.25);
        assert_eq!(snap.underrun_frames, 80);
    }

    #[test]
    fn default_is_idle_at_full_volume() {
        let snap = EngineStatus::default().snapshot();
        assert_eq!(snap.state, EngineState::Idle);
        assert_eq!(snap.volume, 1.0);
        assert_eq!(snap.position_seconds, 0.0);
    }
}
