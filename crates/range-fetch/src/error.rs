//! Error kinds for fetching and reassembly.

/// Download-side failures.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The server answered with a status other than 200/206.
    #[error("HTTP error: {status} for {url}")]
    NetworkFetch {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Connection, TLS, or body read failure.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The endpoint does not serve byte ranges; callers fall back to a single stream.
    #[error("byte ranges unsupported (size {total_size:?})")]
    RangeUnsupported { total_size: Option<u64> },

    #[error("download cancelled")]
    Cancelled,

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl FetchError {
    pub(crate) fn transport(url: &str, err: impl std::fmt::Display) -> Self {
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::NetworkFetch { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Reassembly failures. All of these are fatal for the track being assembled.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("add_fragment called before begin")]
    NotStarted,

    #[error("fragment {got} arrived out of order (expected {expected})")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("fragment {sequence} was already consumed")]
    Duplicate { sequence: u64 },

    #[error("fragment starts at byte {got}, expected {expected}")]
    Gap { expected: u64, got: u64 },

    #[error("fragment {sequence} carries {got} bytes for a {expected}-byte range")]
    FragmentLength { sequence: u64, expected: u64, got: u64 },

    #[error("fragments exceed the expected {total} bytes (got {got})")]
    Overrun { total: u64, got: u64 },

    #[error("download ended at {got} of {expected} bytes")]
    Incomplete { expected: u64, got: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FetchError::transport("u", "reset").is_transient());
        assert!(
            FetchError::NetworkFetch {
                status: 503,
                url: "u".into()
            }
            .is_transient()
        );
        assert!(
            !FetchError::NetworkFetch {
                status: 404,
                url: "u".into()
            }
            .is_transient()
        );
        assert!(!FetchError::RangeUnsupported { total_size: None }.is_transient());
    }
}
