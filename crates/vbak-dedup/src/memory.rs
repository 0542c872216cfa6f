use std::collections::HashMap;

use vbak_types::{ChunkAddr, ContentHash, SessionName, VolumeName};

use crate::error::DedupResult;
use crate::traits::{ChunkLocation, ContentIndex};

/// `HashMap`-backed index, rebuilt every run.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: HashMap<ContentHash, ChunkLocation>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentIndex for MemoryIndex {
    fn lookup(&self, hash: &ContentHash) -> DedupResult<Option<ChunkLocation>> {
        Ok(self.entries.get(hash).cloned())
    }

    fn insert(&mut self, hash: ContentHash, location: ChunkLocation) -> DedupResult<bool> {
        if self.entries.contains_key(&hash) {
            return Ok(false);
        }
        self.entries.insert(hash, location);
        Ok(true)
    }

    fn relocate(
        &mut self,
        volume: &VolumeName,
        from: &SessionName,
        to: &SessionName,
        survives: &dyn Fn(ChunkAddr) -> bool,
    ) -> DedupResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, loc| {
            if loc.volume != *volume || loc.session != *from {
                return true;
            }
            if survives(loc.addr) {
                loc.session = *to;
                true
            } else {
                false
            }
        });
        Ok(before - self.entries.len())
    }

    fn remove_volume(&mut self, volume: &VolumeName) -> DedupResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, loc| loc.volume != *volume);
        Ok(before - self.entries.len())
    }

    fn len(&self) -> DedupResult<usize> {
        Ok(self.entries.len())
    }

    fn clear(&mut self) -> DedupResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::testing;

    #[test]
    fn first_insert_wins() {
        testing::first_insert_wins(&mut MemoryIndex::new());
    }

    #[test]
    fn relocation() {
        testing::relocation(&mut MemoryIndex::new());
    }

    #[test]
    fn volume_removal() {
        testing::volume_removal(&mut MemoryIndex::new());
    }
}
