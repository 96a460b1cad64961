//! Playback request failures.

use audio_player::{DecodeError, EngineError};
use chunk_store::StoreError;
use range_fetch::{AssemblyError, FetchError};

/// Terminal outcome of a playback request, or of one load session.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("render engine: {0}")]
    Engine(#[from] EngineError),

    /// Every loading path failed before anything could be played.
    #[error("no playable block for {track_id}: {reason}")]
    NoPlayableBlock { track_id: String, reason: String },

    #[error("playback request was superseded")]
    Cancelled,

    #[error("background task failed: {0}")]
    Task(String),
}

impl PlaybackError {
    /// Failures during the first block that a single-stream reload may recover from.
    pub fn allows_fallback(&self) -> bool {
        !matches!(
            self,
            PlaybackError::Cancelled | PlaybackError::Engine(_) | PlaybackError::NoPlayableBlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_and_engine_loss_do_not_fall_back() {
        assert!(!PlaybackError::Cancelled.allows_fallback());
        assert!(!PlaybackError::Engine(EngineError::Disconnected).allows_fallback());
        assert!(
            PlaybackError::Fetch(FetchError::Transport {
                url: "http://example.invalid/a.mp3".into(),
                message: "connection reset".into(),
            })
            .allows_fallback()
        );
        assert!(PlaybackError::Decode(DecodeError::Empty).allows_fallback());
        assert!(
            PlaybackError::Assembly(AssemblyError::Incomplete {
                expected: 10,
                got: 5
            })
            .allows_fallback()
        );
    }
}
