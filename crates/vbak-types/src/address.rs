use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::CHUNK_ALIGNMENT;

/// Number of leading hex digits of an address used as the directory prefix.
const PREFIX_DIGITS: usize = 9;

/// Byte offset of a chunk within a volume.
///
/// Addresses are always multiples of the volume's chunk size. The textual
/// form is 16 lowercase hex digits, which also determines where a stored
/// chunk lives inside a session directory: `<first 9 digits>/x<16 digits>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkAddr(u64);

impl ChunkAddr {
    /// Address of the chunk starting at `offset`.
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Address of the `index`-th chunk.
    pub const fn from_index(index: u64, chunk_size: u64) -> Self {
        Self(index * chunk_size)
    }

    /// Address of the chunk containing byte `offset`.
    pub const fn containing(offset: u64, chunk_size: u64) -> Self {
        Self(offset - offset % chunk_size)
    }

    /// Raw byte offset.
    pub const fn offset(&self) -> u64 {
        self.0
    }

    /// Chunk index for the given chunk size.
    pub const fn index(&self, chunk_size: u64) -> u64 {
        self.0 / chunk_size
    }

    /// The following chunk address.
    pub const fn next(&self, chunk_size: u64) -> Self {
        Self(self.0 + chunk_size)
    }

    /// Number of volume bytes covered by this chunk (the final chunk may be short).
    pub fn span(&self, chunk_size: u64, volume_size: u64) -> u64 {
        volume_size.saturating_sub(self.0).min(chunk_size)
    }

    /// 16-digit lowercase hex form.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse the 16-digit hex form.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != 16 {
            return Err(TypeError::InvalidLength {
                expected: 16,
                actual: s.len(),
            });
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| TypeError::InvalidHex(e.to_string()))
    }

    /// Directory prefix grouping stored chunks.
    pub fn prefix(&self) -> String {
        self.to_hex()[..PREFIX_DIGITS].to_string()
    }

    /// Stored chunk file name.
    pub fn file_name(&self) -> String {
        format!("x{}", self.to_hex())
    }

    /// Path of the stored chunk relative to its session directory.
    pub fn storage_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/x{}", &hex[..PREFIX_DIGITS], hex)
    }

    /// Parse a stored chunk file name (`x<hex16>`).
    pub fn from_file_name(name: &str) -> Result<Self, TypeError> {
        match name.strip_prefix('x') {
            Some(hex) => Self::from_hex(hex),
            None => Err(TypeError::InvalidHex(name.to_string())),
        }
    }

    /// Address of the last chunk of a volume of `volume_size` bytes.
    ///
    /// Returns `None` for an empty volume.
    pub fn last_of(volume_size: u64, chunk_size: u64) -> Option<Self> {
        if volume_size == 0 {
            None
        } else {
            Some(Self::containing(volume_size - 1, chunk_size))
        }
    }

    /// Validate a chunk size.
    pub fn check_chunk_size(chunk_size: u64) -> Result<(), TypeError> {
        if chunk_size == 0 || chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(TypeError::InvalidChunkSize {
                size: chunk_size,
                alignment: CHUNK_ALIGNMENT,
            });
        }
        Ok(())
    }
}

/// Number of chunks needed to cover `volume_size` bytes.
pub fn chunk_count(volume_size: u64, chunk_size: u64) -> u64 {
    volume_size.div_ceil(chunk_size)
}

impl fmt::Debug for ChunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkAddr({:#x})", self.0)
    }
}

impl fmt::Display for ChunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CS: u64 = 64 * 1024;

    #[test]
    fn hex_is_sixteen_digits() {
        assert_eq!(ChunkAddr::new(0).to_hex(), "0000000000000000");
        assert_eq!(ChunkAddr::new(0x2_0000).to_hex(), "0000000000020000");
    }

    #[test]
    fn hex_roundtrip() {
        let addr = ChunkAddr::new(0xdead_0000);
        assert_eq!(ChunkAddr::from_hex(&addr.to_hex()).unwrap(), addr);
    }

    #[test]
    fn from_hex_rejects_short_and_garbage() {
        assert!(matches!(
            ChunkAddr::from_hex("abc"),
            Err(TypeError::InvalidLength { .. })
        ));
        assert!(matches!(
            ChunkAddr::from_hex("zzzzzzzzzzzzzzzz"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn storage_path_uses_nine_digit_prefix() {
        let addr = ChunkAddr::new(0x1234_5678_9abc_0000);
        assert_eq!(addr.storage_path(), "123456789/x123456789abc0000");
        assert_eq!(addr.prefix(), "123456789");
        assert_eq!(addr.file_name(), "x123456789abc0000");
    }

    #[test]
    fn file_name_roundtrip() {
        let addr = ChunkAddr::new(3 * CS);
        assert_eq!(ChunkAddr::from_file_name(&addr.file_name()).unwrap(), addr);
        assert!(ChunkAddr::from_file_name("0000000000000000").is_err());
    }

    #[test]
    fn containing_rounds_down() {
        assert_eq!(ChunkAddr::containing(CS + 5, CS), ChunkAddr::new(CS));
        assert_eq!(ChunkAddr::containing(CS - 1, CS), ChunkAddr::new(0));
    }

    #[test]
    fn span_of_final_chunk_is_short() {
        let size = 2 * CS + 100;
        assert_eq!(ChunkAddr::new(CS).span(CS, size), CS);
        assert_eq!(ChunkAddr::new(2 * CS).span(CS, size), 100);
        assert_eq!(ChunkAddr::new(3 * CS).span(CS, size), 0);
    }

    #[test]
    fn last_chunk_and_count() {
        assert_eq!(ChunkAddr::last_of(0, CS), None);
        assert_eq!(ChunkAddr::last_of(CS, CS), Some(ChunkAddr::new(0)));
        assert_eq!(ChunkAddr::last_of(CS + 1, CS), Some(ChunkAddr::new(CS)));
        assert_eq!(chunk_count(CS + 1, CS), 2);
        assert_eq!(chunk_count(0, CS), 0);
    }

    #[test]
    fn chunk_size_validation() {
        assert!(ChunkAddr::check_chunk_size(CS).is_ok());
        assert!(ChunkAddr::check_chunk_size(0).is_err());
        assert!(ChunkAddr::check_chunk_size(5000).is_err());
    }

    #[test]
    fn ordering_follows_offset() {
        assert!(ChunkAddr::new(0) < ChunkAddr::new(CS));
        assert_eq!(ChunkAddr::new(0).next(CS), ChunkAddr::from_index(1, CS));
    }

    proptest::proptest! {
        #[test]
        fn chunks_cover_volume_exactly(size in 0u64..(64 * CS), blocks in 1u64..64) {
            let chunk_size = blocks * CHUNK_ALIGNMENT;
            let count = chunk_count(size, chunk_size);
            let covered: u64 = (0..count)
                .map(|i| ChunkAddr::from_index(i, chunk_size).span(chunk_size, size))
                .sum();
            proptest::prop_assert_eq!(covered, size);
            proptest::prop_assert_eq!(
                ChunkAddr::last_of(size, chunk_size).map(|a| a.index(chunk_size) + 1),
                (count > 0).then_some(count)
            );
        }
    }
}
