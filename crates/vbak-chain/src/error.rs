use thiserror::Error;

use vbak_manifest::ManifestError;
use vbak_types::{SessionName, TypeError};

/// Errors from session chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The session does not exist in the chain.
    #[error("session not found: {0}")]
    NotFound(SessionName),

    /// A session with this name already exists.
    #[error("session already exists: {0}")]
    Duplicate(SessionName),

    /// No session without a predecessor.
    #[error("session chain has no first session")]
    NoRoot,

    /// More than one session without a predecessor.
    #[error("session chain has several first sessions: {0:?}")]
    MultipleRoots(Vec<SessionName>),

    /// Two sessions name the same predecessor.
    #[error("session chain forks after {0}")]
    Fork(SessionName),

    /// A session names a predecessor that does not exist.
    #[error("session {session} refers to missing previous session {previous}")]
    Dangling {
        session: SessionName,
        previous: SessionName,
    },

    /// Sessions not reachable from the first session (a cycle).
    #[error("sessions unreachable from the chain start: {0:?}")]
    Unreachable(Vec<SessionName>),

    /// A new or linked session does not sort after its predecessor.
    #[error("session {name} does not follow {previous}")]
    OutOfOrder {
        previous: SessionName,
        name: SessionName,
    },

    /// The newest session cannot be deleted or pruned.
    #[error("cannot remove the last session {0}")]
    LastSession(SessionName),

    /// The prune selection matched no session.
    #[error("no sessions selected for pruning")]
    NothingToPrune,

    /// A session's storage layout does not support merging.
    #[error("session {0} uses a container layout and cannot be merged")]
    NotMergeable(SessionName),

    /// Chunk and volume sizes do not agree.
    #[error("session {session} chunk size {found} differs from volume chunk size {expected}")]
    ChunkSizeMismatch {
        session: SessionName,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;
