use vbak_types::ContentHash;

/// Domain-separated BLAKE3 content hasher.
///
/// The domain tag is prepended to every hash computation, so stored chunk
/// hashes can never collide with hashes computed for another purpose.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for stored (compressed) chunks.
    pub const CHUNK: Self = Self {
        domain: "vbak-chunk-v1",
    };

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        ContentHash::from_hash(*hasher.finalize().as_bytes())
    }
}
