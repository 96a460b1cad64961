//! Data model shared by the fetch, store, and playback crates.

use std::ops::Range;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque track identifier (unique key in the chunk store).
pub type TrackId = String;

/// One network-fetched byte range, before reassembly.
///
/// Owned by the fetcher until handed to the block assembler, then dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFragment {
    /// Position of this fragment in the download plan (0-based, dense).
    pub sequence_index: u64,
    /// Half-open byte range `[start, end)` within the source file.
    pub byte_range: Range<u64>,
    /// Bytes received for `byte_range`.
    pub payload: Bytes,
    /// Wall time spent fetching this fragment.
    pub fetch_duration_ms: u64,
}

impl DownloadFragment {
    /// Number of bytes this fragment claims to cover.
    pub fn range_len(&self) -> u64 {
        self.byte_range.end.saturating_sub(self.byte_range.start)
    }
}

/// A re-chunked, contiguous unit sized for instant playback or durable storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledBlock {
    /// Block index; index 0 is always the first playable block.
    pub storage_index: u32,
    /// Sequence indices of the fragments that contributed bytes, in order.
    pub source_fragments: Vec<u64>,
    /// Length of `payload`.
    pub total_bytes: u64,
    /// Contiguous bytes of the source file.
    pub payload: Bytes,
    /// `true` only for block 0.
    pub is_first_playable: bool,
}

/// Persisted per-track metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_id: TrackId,
    pub display_name: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Number of stored blocks that make up the complete track.
    pub total_block_count: u32,
    pub source_url: String,
    pub file_size_bytes: u64,
    /// Milliseconds since the Unix epoch.
    pub last_accessed_at_ms: i64,
}

/// Decoded PCM persisted for one assembled block.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredBlock {
    pub track_id: TrackId,
    pub block_index: u32,
    pub sample_rate: u32,
    /// Frames per channel.
    pub sample_count: u64,
    /// One planar payload per channel, each `sample_count` long.
    pub channel_payloads: Vec<Vec<f32>>,
}

impl StoredBlock {
    /// Bytes occupied by the fixed-width sample payloads.
    pub fn payload_bytes(&self) -> u64 {
        self.channel_payloads
            .iter()
            .map(|ch| (ch.len() * std::mem::size_of::<f32>()) as u64)
            .sum()
    }

    /// Channel count derived from the payloads.
    pub fn channel_count(&self) -> usize {
        self.channel_payloads.len()
    }
}

/// How a playback request loads its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Prioritised small first block, upgrades in the background.
    Instant,
    /// Concurrent fan-out from the start; plays after the first storage block.
    Progressive,
    /// Whole-file download, then play.
    Standard,
}

/// Coarse connection speed derived from the throughput estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    Unknown,
    Slow,
    Moderate,
    Fast,
}

impl ConnectionClass {
    /// Classify a throughput estimate in bytes per second.
    pub fn from_throughput(bytes_per_sec: Option<f64>) -> Self {
        match bytes_per_sec {
            None => ConnectionClass::Unknown,
            Some(bps) if !bps.is_finite() || bps <= 0.0 => ConnectionClass::Unknown,
            Some(bps) if bps < 128.0 * 1024.0 => ConnectionClass::Slow,
            Some(bps) if bps < 1024.0 * 1024.0 => ConnectionClass::Moderate,
            Some(_) => ConnectionClass::Fast,
        }
    }
}

/// Render session state as seen from outside the real-time context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Armed,
    Rendering,
}

/// Position/status snapshot published by the render engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub state: EngineState,
    pub position_seconds: f64,
    pub duration_seconds: f64,
    /// Block index of the active buffer.
    pub buffer_index: u32,
    pub volume: f32,
    /// Frames rendered as silence while `Rendering` with nothing to play.
    pub underrun_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_range_len_is_half_open() {
        let frag = DownloadFragment {
            sequence_index: 0,
            byte_range: 10..20,
            payload: Bytes::from_static(&[0; 10]),
            fetch_duration_ms: 1,
        };
        assert_eq!(frag.range_len(), 10);
    }

    #[test]
    fn stored_block_payload_bytes_counts_all_channels() {
        let block = StoredBlock {
            track_id: "t".to_string(),
            block_index: 0,
            sample_rate: 48_000,
            sample_count: 4,
            channel_payloads: vec![vec![0.0; 4], vec![0.0; 4]],
        };
        assert_eq!(block.payload_bytes(), 32);
        assert_eq!(block.channel_count(), 2);
    }

    #[test]
    fn connection_class_thresholds() {
        assert_eq!(ConnectionClass::from_throughput(None), ConnectionClass::Unknown);
        assert_eq!(ConnectionClass::from_throughput(Some(f64::NAN)), ConnectionClass::Unknown);
        assert_eq!(ConnectionClass::from_throughput(Some(50_000.0)), ConnectionClass::Slow);
        assert_eq!(ConnectionClass::from_throughput(Some(500_000.0)), ConnectionClass::Moderate);
        assert_eq!(ConnectionClass::from_throughput(Some(5_000_000.0)), ConnectionClass::Fast);
    }
}
