//! Chunk encoding for vbak.
//!
//! A raw volume chunk is turned into what gets stored on the destination in
//! three steps: zero detection, compression with the configured
//! [`ChunkCodec`], and hashing of the compressed bytes with the
//! domain-separated [`ContentHasher`]. [`ChunkPipeline`] ties these together
//! and also implements the reverse direction, where every stored chunk is
//! length-bounded and hash-checked *before* it is decompressed.

pub mod codec;
pub mod error;
pub mod hasher;
pub mod pipeline;

pub use codec::{ChunkCodec, ZstdCodec, DEFAULT_ZSTD_LEVEL};
pub use error::{CodecError, CodecResult};
pub use hasher::ContentHasher;
pub use pipeline::{is_zero, ChunkPipeline, Encoded};
