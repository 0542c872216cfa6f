use std::path::PathBuf;

/// Errors from delta digest operations.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// A diff report could not be interpreted.
    #[error("malformed diff report: {0}")]
    Malformed(String),

    /// The diff granularity does not divide the chunk size.
    #[error("diff granularity {granularity} does not divide chunk size {chunk_size}")]
    Granularity { granularity: u64, chunk_size: u64 },

    /// No dirty map exists where one is required.
    #[error("dirty map missing at {0}")]
    MissingMap(PathBuf),

    /// Chunk index outside the map.
    #[error("chunk {index} outside dirty map of {chunks} chunks")]
    OutOfRange { index: u64, chunks: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for digest operations.
pub type DigestResult<T> = Result<T, DigestError>;
