use std::fmt;

use thiserror::Error;
use vbak_chain::ChainError;
use vbak_codec::CodecError;
use vbak_dedup::DedupError;
use vbak_digest::DigestError;
use vbak_manifest::ManifestError;
use vbak_store::StoreError;
use vbak_types::{ChunkAddr, TypeError, VolumeName};

/// Broad failure categories, deciding how far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad request or configuration; the operation is aborted, other
    /// volumes proceed.
    Input,
    /// The diff producer failed; collected across a batch.
    DiffSource,
    /// Stored data failed verification; always fatal.
    Integrity,
    /// Destination or helper failure; fatal for the operation, temporary
    /// state is kept for recovery.
    Transport,
    /// Local metadata is inconsistent; needs operator intervention.
    State,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::DiffSource => "diff source",
            Self::Integrity => "integrity",
            Self::Transport => "transport",
            Self::State => "state",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("another instance holds the lock on {0}")]
    Locked(String),

    #[error("diff of volume {volume} failed: {reason}")]
    DiffSource { volume: VolumeName, reason: String },

    #[error("chunk {addr}: {reason}")]
    Integrity { addr: ChunkAddr, reason: String },

    #[error("merged manifest has no entry for chunk {0}")]
    MissingEntry(ChunkAddr),

    #[error("inconsistent state of volume {volume}: {reason}")]
    State { volume: VolumeName, reason: String },

    #[error("{} volumes failed", .0.len())]
    Batch(Vec<(VolumeName, EngineError)>),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("dirty map error: {0}")]
    Digest(#[from] DigestError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("session chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("dedup index error: {0}")]
    Dedup(#[from] DedupError),

    #[error("destination error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn state(volume: &VolumeName, reason: impl Into<String>) -> Self {
        Self::State {
            volume: volume.clone(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownVolume(_) | Self::InvalidConfig(_) | Self::Type(_) | Self::Config(_) => {
                ErrorClass::Input
            }
            Self::Locked(_) | Self::State { .. } | Self::Manifest(_) | Self::Dedup(_) => {
                ErrorClass::State
            }
            Self::DiffSource { .. } | Self::Batch(_) => ErrorClass::DiffSource,
            Self::Integrity { .. } | Self::MissingEntry(_) => ErrorClass::Integrity,
            Self::Io(_) => ErrorClass::Transport,
            Self::Codec(e) => match e {
                CodecError::Io(_) => ErrorClass::Transport,
                _ => ErrorClass::Integrity,
            },
            Self::Digest(e) => match e {
                DigestError::Malformed(_)
                | DigestError::Granularity { .. }
                | DigestError::Json(_) => {
                    ErrorClass::DiffSource
                }
                DigestError::MissingMap(_) | DigestError::OutOfRange { .. } => ErrorClass::State,
                DigestError::Io(_) => ErrorClass::Transport,
            },
            Self::Chain(e) => match e {
                ChainError::NotFound(_)
                | ChainError::Duplicate(_)
                | ChainError::OutOfOrder { .. }
                | ChainError::LastSession(_)
                | ChainError::NothingToPrune
                | ChainError::NotMergeable(_)
                | ChainError::ChunkSizeMismatch { .. }
                | ChainError::Type(_) => ErrorClass::Input,
                ChainError::Io(_) => ErrorClass::Transport,
                _ => ErrorClass::State,
            },
            Self::Store(e) => match e {
                StoreError::TooLarge { .. }
                | StoreError::UnexpectedEntry { .. }
                | StoreError::Truncated(_) => ErrorClass::Integrity,
                StoreError::InvalidPath(_) => ErrorClass::Input,
                _ => ErrorClass::Transport,
            },
        }
    }

    /// Whether a batch may continue with other volumes after this error.
    pub fn is_per_volume(&self) -> bool {
        matches!(self.class(), ErrorClass::Input | ErrorClass::DiffSource)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use vbak_types::{ContentHash, SessionName};

    fn vol() -> VolumeName {
        VolumeName::new("root").unwrap()
    }

    #[test]
    fn classes() {
        let hash = ContentHash::of(b"x");
        assert_eq!(
            EngineError::from(CodecError::HashMismatch {
                expected: hash,
                computed: hash
            })
            .class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            EngineError::from(StoreError::Truncated(3)).class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            EngineError::from(StoreError::Timeout("helper".into(), 5)).class(),
            ErrorClass::Transport
        );
        assert_eq!(
            EngineError::from(DigestError::Malformed("x".into())).class(),
            ErrorClass::DiffSource
        );
        let name: SessionName = "S_20240101-000000".parse().unwrap();
        assert_eq!(
            EngineError::from(ChainError::LastSession(name)).class(),
            ErrorClass::Input
        );
        assert_eq!(
            EngineError::from(ChainError::Fork(name)).class(),
            ErrorClass::State
        );
        assert_eq!(EngineError::state(&vol(), "x").class(), ErrorClass::State);
    }

    #[test]
    fn per_volume_errors() {
        assert!(EngineError::UnknownVolume("x".into()).is_per_volume());
        assert!(EngineError::DiffSource {
            volume: vol(),
            reason: "exit 1".into()
        }
        .is_per_volume());
        assert!(!EngineError::MissingEntry(ChunkAddr::new(0)).is_per_volume());
    }
}
