use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Open failed on every attempt.
    #[error("chunk store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },
    /// A single operation exceeded its deadline.
    #[error("chunk store {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("corrupt {what}: {message}")]
    Corrupt { what: &'static str, message: String },
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    /// `true` for faults that say nothing about the stored data itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. }
                | StoreError::Timeout { .. }
                | StoreError::Pool(_)
                | StoreError::Worker(_)
        )
    }
}
