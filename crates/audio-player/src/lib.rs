//! Real-time playback of progressively growing PCM buffers.
//!
//! The [`engine::RenderEngine`] runs inside the output callback and is driven only through
//! non-blocking channels ([`engine::EngineHandle`]). Decoding and resampling happen off the
//! real-time thread, incrementally as bytes arrive, and hand finished
//! [`buffer::PcmBuffer`]s to the engine.

pub mod buffer;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod output;
pub mod resample;
pub mod status;

pub use buffer::PcmBuffer;
pub use config::{EngineConfig, OutputConfig};
pub use decode::{DecodeProgress, StreamDecoder, StreamFormat};
pub use engine::{EngineCommand, EngineEvent, EngineHandle, RejectReason, RenderEngine};
pub use error::{DecodeError, EngineError};
pub use output::{OutputEvent, OutputHost};
pub use resample::StreamResampler;
pub use status::EngineStatus;
