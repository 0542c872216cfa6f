use thiserror::Error;

/// Errors from deduplication index operations.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted row could not be decoded.
    #[error("invalid index data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Manifest(#[from] vbak_manifest::ManifestError),
}

/// Result alias for index operations.
pub type DedupResult<T> = std::result::Result<T, DedupError>;
