//! Content-hash deduplication index for vbak.
//!
//! Maps the hash of every stored chunk to the first place it was stored
//! (volume, session, address). A send that produces a chunk whose hash is
//! already indexed emits a back-reference (hard link) instead of the data.
//!
//! # Backends
//!
//! All backends implement the [`ContentIndex`] trait:
//!
//! - [`MemoryIndex`] -- `HashMap`, rebuilt every run
//! - [`BucketIndex`] -- 256 fan-out buckets of sorted fixed-width records
//! - [`SqliteIndex`] -- indexed SQLite table, optionally persisted to a file
//!
//! # Rules
//!
//! 1. At most one location per hash; the first insert wins.
//! 2. When a session disappears in a merge, its entries move to the merge
//!    target if the chunk survives, and are dropped otherwise.

pub mod bucket;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use bucket::BucketIndex;
pub use error::{DedupError, DedupResult};
pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;
pub use traits::{open_index, populate, ChunkLocation, ContentIndex, IndexKind};
