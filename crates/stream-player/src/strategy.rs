//! Load strategy selection.

use audio_stream_types::{ConnectionClass, LoadStrategy};

/// Files below this size are downloaded whole before playing.
pub const STANDARD_MAX_BYTES: u64 = 512 * 1024;
/// Files above this size fan out immediately on fast connections.
pub const PROGRESSIVE_MIN_BYTES: u64 = 32 * 1024 * 1024;

/// Pick a strategy from the advertised size and the connection class.
///
/// Unknown sizes always load instantly; there is nothing to plan against.
pub fn select_strategy(size: Option<u64>, connection: ConnectionClass) -> LoadStrategy {
    match size {
        Some(size) if size < STANDARD_MAX_BYTES => LoadStrategy::Standard,
        Some(size) if size > PROGRESSIVE_MIN_BYTES && connection == ConnectionClass::Fast => {
            LoadStrategy::Progressive
        }
        _ => LoadStrategy::Instant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_files_use_standard() {
        assert_eq!(
            select_strategy(Some(100 * 1024), ConnectionClass::Fast),
            LoadStrategy::Standard
        );
        assert_eq!(
            select_strategy(Some(STANDARD_MAX_BYTES - 1), ConnectionClass::Slow),
            LoadStrategy::Standard
        );
    }

    #[test]
    fn large_files_on_fast_links_use_progressive() {
        let big = Some(PROGRESSIVE_MIN_BYTES + 1);
        assert_eq!(select_strategy(big, ConnectionClass::Fast), LoadStrategy::Progressive);
        assert_eq!(select_strategy(big, ConnectionClass::Moderate), LoadStrategy::Instant);
        assert_eq!(select_strategy(big, ConnectionClass::Unknown), LoadStrategy::Instant);
    }

    #[test]
    fn everything_else_is_instant() {
        assert_eq!(select_strategy(None, ConnectionClass::Fast), LoadStrategy::Instant);
        assert_eq!(
            select_strategy(Some(8 * 1024 * 1024), ConnectionClass::Fast),
            LoadStrategy::Instant
        );
        assert_eq!(
            select_strategy(Some(STANDARD_MAX_BYTES), ConnectionClass::Slow),
            LoadStrategy::Instant
        );
    }
}
