use serde::Serialize;
use vbak_types::{ChunkAddr, SessionName, VolumeName};

use crate::error::{EngineError, EngineResult};

/// Outcome of a monitor pass over one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub volume: VolumeName,
    /// No sessions yet; the next send transfers the whole volume.
    pub full_transfer_pending: bool,
    pub changed_bytes: u64,
    pub freed_bytes: u64,
    pub chunks_marked: u64,
}

/// Outcome of a send of one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    /// The committed session; `None` when nothing needed sending.
    pub session: Option<SessionName>,
    pub volume_size: u64,
    /// Chunks examined because they were dirty or in a resent range.
    pub chunks_eligible: u64,
    pub chunks_stored: u64,
    pub chunks_linked: u64,
    pub zero_chunks: u64,
    /// Compressed bytes streamed to the destination.
    pub bytes_sent: u64,
    /// Raw bytes read from the volume.
    pub bytes_read: u64,
    pub changed_bytes: u64,
    pub freed_bytes: u64,
}

/// Outcome of a receive, verify or diff of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiveReport {
    pub session: SessionName,
    pub volume_size: u64,
    pub chunks: u64,
    pub zero_chunks: u64,
    pub bytes_fetched: u64,
    pub bytes_written: u64,
    /// Chunks differing from the reference volume (diff mode).
    pub differing: Vec<ChunkAddr>,
    /// Size of the reference volume when it differs from the session's.
    pub reference_size: Option<u64>,
}

impl ReceiveReport {
    pub(crate) fn new(session: SessionName, volume_size: u64) -> Self {
        Self {
            session,
            volume_size,
            chunks: 0,
            zero_chunks: 0,
            bytes_fetched: 0,
            bytes_written: 0,
            differing: Vec::new(),
            reference_size: None,
        }
    }
}

/// Outcome of a prune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<SessionName>,
    pub target: SessionName,
    pub chunks_relocated: usize,
    pub chunks_discarded: usize,
}

/// Results of one operation across several volumes.
///
/// Per-volume failures (input and diff-source errors) are collected here;
/// any other failure aborts the batch.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub completed: Vec<(VolumeName, T)>,
    pub failed: Vec<(VolumeName, EngineError)>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// The completed results, or every per-volume failure as one
    /// [`EngineError::Batch`].
    pub fn into_result(self) -> EngineResult<Vec<(VolumeName, T)>> {
        if self.failed.is_empty() {
            Ok(self.completed)
        } else {
            Err(EngineError::Batch(self.failed))
        }
    }
}
