//! stream-player: play a remote audio file while it downloads.
//!
//! ## Pipeline
//! 1. **Fetch**: probe the URL, then pull byte ranges with bounded fan-out (or one plain GET
//!    when the server ignores ranges).
//! 2. **Assemble**: re-chunk fragments into a small first block and storage-sized blocks.
//! 3. **Decode**: Symphonia decodes the growing prefix; Rubato resamples to the device rate.
//! 4. **Render**: the CPAL callback plays the newest buffer and swaps in larger ones without
//!    moving the playhead.
//! 5. **Cache**: decoded blocks go to SQLite so the next play starts offline.

mod cli;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stream_player=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    runtime::run(args).await
}
