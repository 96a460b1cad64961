/// Payload rejected while turning bytes into PCM.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported or unrecognised stream: {0}")]
    Unsupported(String),
    #[error("no decodable audio track")]
    NoTrack,
    #[error("stream decoded to zero frames")]
    Empty,
    /// The container or codec gave up part way through the stream.
    #[error("stream decode failed: {0}")]
    Stream(String),
    #[error("decoder thread unavailable: {0}")]
    Worker(String),
    #[error("resample failed: {0}")]
    Resample(String),
}

/// Command could not be queued for the render thread.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine command queue is full")]
    Busy,
    #[error("render engine is gone")]
    Disconnected,
}
