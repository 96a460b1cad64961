//! Streaming playback of remote audio files.
//!
//! [`StreamPlayer`] is the caller-facing side of the pipeline: it probes the source, picks a
//! [`LoadStrategy`](audio_stream_types::LoadStrategy), runs range fetch and block assembly,
//! feeds progressively larger buffers to the render engine and persists decoded blocks so a
//! later request can play from the cache without touching the network.

pub mod config;
pub mod error;
pub mod output;
pub mod player;
pub mod progress;
mod session;
pub mod strategy;

pub use config::{FileConfig, PlayerSettings};
pub use error::PlaybackError;
pub use output::{AudioOutput, DetachedOutput};
pub use player::{LoadSource, PlaybackStart, StreamPlayer};
pub use progress::{ChunkProgress, LoadSummary, PlayCallbacks};
pub use strategy::select_strategy;
