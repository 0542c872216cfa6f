use tracing::debug;
use vbak_types::ContentHash;

use crate::codec::ChunkCodec;
use crate::error::{CodecError, CodecResult};
use crate::hasher::ContentHasher;

/// Returns `true` if every byte of `buf` is zero.
pub fn is_zero(buf: &[u8]) -> bool {
    let mut words = buf.chunks_exact(8);
    let zero_words = words
        .by_ref()
        .all(|w| u64::from_ne_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]) == 0);
    zero_words && words.remainder().iter().all(|b| *b == 0)
}

/// Result of encoding one raw chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// All-zero chunk represented by a zero-marker, nothing stored.
    Zero,
    /// Compressed bytes and the hash of those bytes.
    Stored { hash: ContentHash, bytes: Vec<u8> },
}

/// Encodes raw chunks for storage and verifies stored chunks on the way back.
pub struct ChunkPipeline {
    codec: Box<dyn ChunkCodec>,
    hasher: ContentHasher,
    chunk_size: usize,
}

impl ChunkPipeline {
    pub fn new(codec: Box<dyn ChunkCodec>, chunk_size: usize) -> Self {
        Self {
            codec,
            hasher: ContentHasher::CHUNK,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn codec(&self) -> &dyn ChunkCodec {
        self.codec.as_ref()
    }

    /// Largest stored chunk accepted from a destination.
    pub fn stored_len_bound(&self) -> usize {
        self.codec.max_stored_len(self.chunk_size)
    }

    /// Encode a raw chunk. Zero chunks collapse to [`Encoded::Zero`] unless
    /// `store_zero` is set (the final chunk of a volume is always stored).
    pub fn encode(&self, raw: &[u8], store_zero: bool) -> CodecResult<Encoded> {
        if !store_zero && is_zero(raw) {
            return Ok(Encoded::Zero);
        }
        let bytes = self.codec.compress(raw)?;
        let hash = self.hasher.hash(&bytes);
        debug!(raw = raw.len(), stored = bytes.len(), hash = %hash.short_hex(), "encoded chunk");
        Ok(Encoded::Stored { hash, bytes })
    }

    /// Check a stored chunk's length bound and hash without decompressing it.
    pub fn verify(&self, stored: &[u8], expected: &ContentHash) -> CodecResult<()> {
        let bound = self.stored_len_bound();
        if stored.len() > bound {
            return Err(CodecError::Oversized {
                len: stored.len(),
                bound,
            });
        }
        let computed = self.hasher.hash(stored);
        if computed != *expected {
            return Err(CodecError::HashMismatch {
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }

    /// Verify and decompress a stored chunk that must decode to exactly
    /// `expected_len` bytes.
    pub fn decode(
        &self,
        stored: &[u8],
        expected: &ContentHash,
        expected_len: usize,
    ) -> CodecResult<Vec<u8>> {
        self.verify(stored, expected)?;
        let raw = self.codec.decompress(stored, self.chunk_size)?;
        if raw.len() != expected_len {
            return Err(CodecError::LengthMismatch {
                expected: expected_len,
                actual: raw.len(),
            });
        }
        Ok(raw)
    }
}
