use vbak_types::ChunkAddr;

/// Errors from manifest and record encoding.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// A line could not be parsed.
    #[error("malformed manifest line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// Addresses are not strictly ascending.
    #[error("manifest address {addr} follows {previous}")]
    OutOfOrder { previous: ChunkAddr, addr: ChunkAddr },

    /// A metadata record is missing a required key.
    #[error("record is missing key {0:?}")]
    MissingKey(String),

    /// A metadata record value could not be interpreted.
    #[error("record key {key:?} has invalid value {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;
