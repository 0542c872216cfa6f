use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("malformed session name: {0:?}")]
    InvalidSessionName(String),

    #[error("invalid volume name: {0:?}")]
    InvalidVolumeName(String),

    #[error("invalid chunk size {size}: must be a non-zero multiple of {alignment}")]
    InvalidChunkSize { size: u64, alignment: u64 },

    #[error("unknown storage layout: {0:?}")]
    UnknownLayout(String),
}
