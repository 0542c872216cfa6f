use std::fmt;

use vbak_types::{ChunkAddr, ContentHash};

/// One manifest line: a chunk address and the hash of its stored bytes,
/// or `None` for a zero-marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub addr: ChunkAddr,
    pub hash: Option<ContentHash>,
}

impl ManifestEntry {
    pub fn stored(addr: ChunkAddr, hash: ContentHash) -> Self {
        Self {
            addr,
            hash: Some(hash),
        }
    }

    pub fn zero(addr: ChunkAddr) -> Self {
        Self { addr, hash: None }
    }

    pub fn is_zero(&self) -> bool {
        self.hash.is_none()
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Self, String> {
        let (hash, addr) = line
            .split_once(' ')
            .ok_or_else(|| format!("expected two fields in {line:?}"))?;
        let addr = ChunkAddr::from_hex(addr).map_err(|e| e.to_string())?;
        let hash = match hash {
            "0" => None,
            hex => Some(ContentHash::from_hex(hex).map_err(|e| e.to_string())?),
        };
        Ok(Self { addr, hash })
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{} {}", hash, self.addr),
            None => write!(f, "0 {}", self.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let hash = ContentHash::of(b"x");
        let entry = ManifestEntry::stored(ChunkAddr::new(0x20000), hash);
        assert_eq!(entry.to_string(), format!("{} 0000000000020000", hash.to_hex()));
        assert_eq!(
            ManifestEntry::zero(ChunkAddr::new(0)).to_string(),
            "0 0000000000000000"
        );
    }

    #[test]
    fn parse_roundtrip() {
        let entry = ManifestEntry::stored(ChunkAddr::new(0x40000), ContentHash::of(b"y"));
        assert_eq!(ManifestEntry::parse(&entry.to_string()).unwrap(), entry);
        let zero = ManifestEntry::zero(ChunkAddr::new(0x10000));
        assert_eq!(ManifestEntry::parse(&zero.to_string()).unwrap(), zero);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ManifestEntry::parse("").is_err());
        assert!(ManifestEntry::parse("0").is_err());
        assert!(ManifestEntry::parse("abc 0000000000000000").is_err());
        assert!(ManifestEntry::parse("0 12").is_err());
    }
}
