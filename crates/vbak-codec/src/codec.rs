use std::io::Read;

use crate::error::{CodecError, CodecResult};

/// Default zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// A compression codec applied to every stored chunk.
pub trait ChunkCodec: Send + Sync {
    /// Short name recorded in diagnostics.
    fn name(&self) -> &'static str;

    /// Compress one raw chunk.
    fn compress(&self, raw: &[u8]) -> CodecResult<Vec<u8>>;

    /// Decompress a stored chunk, refusing to produce more than `max_len` bytes.
    fn decompress(&self, stored: &[u8], max_len: usize) -> CodecResult<Vec<u8>>;

    /// Worst-case stored size of a raw chunk of `raw_len` bytes.
    fn max_stored_len(&self, raw_len: usize) -> usize;
}

/// zstd codec.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl ChunkCodec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, raw: &[u8]) -> CodecResult<Vec<u8>> {
        zstd::encode_all(raw, self.level).map_err(|e| CodecError::Codec(e.to_string()))
    }

    fn decompress(&self, stored: &[u8], max_len: usize) -> CodecResult<Vec<u8>> {
        let decoder =
            zstd::stream::read::Decoder::new(stored).map_err(|e| CodecError::Codec(e.to_string()))?;
        let mut out = Vec::with_capacity(max_len);
        decoder
            .take(max_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Codec(e.to_string()))?;
        if out.len() > max_len {
            return Err(CodecError::LengthMismatch {
                expected: max_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }

    fn max_stored_len(&self, raw_len: usize) -> usize {
        zstd::zstd_safe::compress_bound(raw_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_decompress_roundtrip() {
        let codec = ZstdCodec::default();
        let raw: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let stored = codec.compress(&raw).unwrap();
        assert!(stored.len() < raw.len());
        assert_eq!(codec.decompress(&stored, raw.len()).unwrap(), raw);
    }

    #[test]
    fn decompress_is_bounded() {
        let codec = ZstdCodec::default();
        let stored = codec.compress(&vec![7u8; 10_000]).unwrap();
        let err = codec.decompress(&stored, 4096).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { expected: 4096, .. }));
    }

    #[test]
    fn garbage_does_not_decode() {
        let codec = ZstdCodec::default();
        assert!(codec.decompress(b"definitely not zstd", 4096).is_err());
    }

    #[test]
    fn bound_covers_incompressible_data() {
        let codec = ZstdCodec::new(1);
        let raw: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let stored = codec.compress(&raw).unwrap();
        assert!(stored.len() <= codec.max_stored_len(raw.len()));
        assert_eq!(codec.name(), "zstd");
        assert_eq!(codec.level(), 1);
    }
}
