//! Load progress callbacks.

use std::sync::Arc;

/// One assembled block arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkProgress {
    pub track_id: String,
    pub block_index: u32,
    pub block_bytes: u64,
    /// Bytes assembled so far, this block included.
    pub loaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// The whole track is available for playback.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadSummary {
    pub track_id: String,
    pub blocks: u32,
    pub bytes: u64,
    pub duration_seconds: f64,
    pub from_cache: bool,
}

type ChunkFn = Arc<dyn Fn(&ChunkProgress) + Send + Sync>;
type LoadedFn = Arc<dyn Fn(&LoadSummary) + Send + Sync>;

/// Optional observers for a playback request.
#[derive(Clone, Default)]
pub struct PlayCallbacks {
    chunk_loaded: Option<ChunkFn>,
    fully_loaded: Option<LoadedFn>,
}

impl PlayCallbacks {
    pub fn on_chunk_loaded(mut self, f: impl Fn(&ChunkProgress) + Send + Sync + 'static) -> Self {
        self.chunk_loaded = Some(Arc::new(f));
        self
    }

    pub fn on_fully_loaded(mut self, f: impl Fn(&LoadSummary) + Send + Sync + 'static) -> Self {
        self.fully_loaded = Some(Arc::new(f));
        self
    }

    pub(crate) fn chunk_loaded(&self, progress: &ChunkProgress) {
        if let Some(f) = &self.chunk_loaded {
            f(progress);
        }
    }

    pub(crate) fn fully_loaded(&self, summary: &LoadSummary) {
        if let Some(f) = &self.fully_loaded {
            f(summary);
        }
    }
}

impl std::fmt::Debug for PlayCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayCallbacks")
            .field("chunk_loaded", &self.chunk_loaded.is_some())
            .field("fully_loaded", &self.fully_loaded.is_some())
            .finish()
    }
}
