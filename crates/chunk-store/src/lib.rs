//! Persistent block cache for decoded tracks.
//!
//! SQLite-backed store of [`TrackRecord`]s and per-block PCM ([`StoredBlock`]) keyed by
//! `(track_id, block_index)`. Every call runs on the blocking pool under a fixed timeout;
//! a timeout surfaces as [`StoreError::Timeout`], distinct from a missing row (`Ok(None)`).
//!
//! [`TrackRecord`]: audio_stream_types::TrackRecord
//! [`StoredBlock`]: audio_stream_types::StoredBlock

mod codec;
pub mod config;
pub mod error;
pub mod store;

pub use config::StoreConfig;
pub use error::StoreError;
pub use store::{ChunkStore, EvictionReport, StoreStats};
