use vbak_types::ContentHash;

/// Errors from chunk encoding and verification.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Stored chunk exceeds the worst-case compressed size of one chunk.
    #[error("stored chunk is {len} bytes, exceeding the bound of {bound}")]
    Oversized { len: usize, bound: usize },

    /// Content hash of the stored bytes does not match the manifest.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ContentHash,
        computed: ContentHash,
    },

    /// Decompressed chunk has the wrong size.
    #[error("decoded chunk is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Compression or decompression failure.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
