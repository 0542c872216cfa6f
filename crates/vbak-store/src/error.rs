/// Errors from destination operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested file does not exist.
    #[error("not found on destination: {0}")]
    NotFound(String),

    /// Path is absolute or escapes the archive root.
    #[error("invalid destination path: {0:?}")]
    InvalidPath(String),

    /// A fetched file exceeds the allowed size.
    #[error("{path} is {len} bytes, exceeding the limit of {limit}")]
    TooLarge { path: String, len: u64, limit: u64 },

    /// A helper command failed.
    #[error("destination command `{command}` failed with {status}: {stderr}")]
    Transport {
        command: String,
        status: String,
        stderr: String,
    },

    /// The stream consumer did not finish in time and was terminated.
    #[error("{0} did not finish within {1} seconds")]
    Timeout(String, u64),

    /// The stream consumer failed.
    #[error("stream consumer failed: {0}")]
    Consumer(String),

    /// A fetch stream delivered something other than what was requested.
    #[error("fetch stream returned {found:?}, expected {expected:?}")]
    UnexpectedEntry { expected: String, found: String },

    /// A fetch stream ended before every requested file was delivered.
    #[error("fetch stream ended early, {0} files missing")]
    Truncated(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for destination operations.
pub type StoreResult<T> = Result<T, StoreError>;
