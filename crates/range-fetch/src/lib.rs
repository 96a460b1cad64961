//! Range-aware download and block reassembly.
//!
//! Data flows `RangeFetcher` → ordered [`DownloadFragment`]s → [`BlockAssembler`] →
//! [`AssembledBlock`]s. The fetcher owns network concerns (probing, chunk planning,
//! bounded fan-out, throughput estimation); the assembler re-chunks whatever fragment
//! sizes arrive into one first-playable block and storage-sized blocks after it.
//!
//! [`DownloadFragment`]: audio_stream_types::DownloadFragment
//! [`AssembledBlock`]: audio_stream_types::AssembledBlock

pub mod assembler;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod plan;
pub mod probe;
pub mod throughput;

pub use assembler::{AssemblerConfig, AssemblerEvent, BlockAssembler};
pub use config::FetchConfig;
pub use error::{AssemblyError, FetchError};
pub use fetcher::{FragmentStream, RangeFetcher};
pub use plan::{AdaptivePlan, ChunkDescriptor};
pub use probe::RangeProbe;
pub use throughput::ThroughputEstimator;
