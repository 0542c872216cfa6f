//! Foundation types for vbak, the incremental chunk-addressed volume backup
//! engine.
//!
//! Every other vbak crate depends on `vbak-types`.
//!
//! # Key Types
//!
//! - [`ChunkAddr`] -- byte offset of a fixed-size chunk within a volume
//! - [`ContentHash`] -- BLAKE3 hash of a stored (compressed) chunk
//! - [`SessionName`] -- timestamp-derived, monotonically ordered session name
//! - [`VolumeName`] / [`VolumeId`] -- volume identity
//! - [`StorageLayout`] -- physical layout tag of a session

pub mod address;
pub mod error;
pub mod hash;
pub mod session;
pub mod volume;

pub use address::{chunk_count, ChunkAddr};
pub use error::TypeError;
pub use hash::ContentHash;
pub use session::{SessionName, TEMP_SUFFIX};
pub use volume::{StorageLayout, VolumeId, VolumeName};

/// Archive format version written into every volume record.
pub const FORMAT_VERSION: u32 = 1;

/// Default chunk size (128 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024;

/// Chunk sizes must be a multiple of this many bytes.
pub const CHUNK_ALIGNMENT: u64 = 4096;
