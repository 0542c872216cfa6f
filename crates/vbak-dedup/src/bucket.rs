use vbak_types::{ChunkAddr, ContentHash, SessionName, VolumeName};

use crate::error::DedupResult;
use crate::traits::{ChunkLocation, ContentIndex};

const FAN_OUT: usize = 256;

/// Fixed-width index record: the full hash and a slot in the location table.
#[derive(Debug, Clone, Copy)]
struct Record {
    hash: ContentHash,
    slot: u32,
}

/// Segmented index keyed by the first hash byte.
///
/// Each of the 256 buckets holds fixed-width records sorted by hash, so a
/// lookup is one fan-out step plus a binary search over a small slice.
/// Locations live in a side table addressed by slot number.
#[derive(Debug)]
pub struct BucketIndex {
    buckets: Vec<Vec<Record>>,
    locations: Vec<Option<ChunkLocation>>,
    live: usize,
}

impl BucketIndex {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); FAN_OUT],
            locations: Vec::new(),
            live: 0,
        }
    }

    fn bucket(&self, hash: &ContentHash) -> &Vec<Record> {
        &self.buckets[hash.first_byte() as usize]
    }

    fn search(bucket: &[Record], hash: &ContentHash) -> Result<usize, usize> {
        bucket.binary_search_by(|entry| entry.hash.cmp(hash))
    }

    /// Apply `keep` to every live location, dropping records it rejects.
    fn retain(&mut self, mut keep: impl FnMut(&mut ChunkLocation) -> bool) -> usize {
        let mut dropped = 0;
        let locations = &mut self.locations;
        for bucket in &mut self.buckets {
            bucket.retain(|record| {
                let slot = &mut locations[record.slot as usize];
                let Some(location) = slot.as_mut() else {
                    return false;
                };
                if keep(location) {
                    true
                } else {
                    *slot = None;
                    dropped += 1;
                    false
                }
            });
        }
        self.live -= dropped;
        dropped
    }
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentIndex for BucketIndex {
    fn lookup(&self, hash: &ContentHash) -> DedupResult<Option<ChunkLocation>> {
        let bucket = self.bucket(hash);
        Ok(Self::search(bucket, hash)
            .ok()
            .and_then(|pos| self.locations[bucket[pos].slot as usize].clone()))
    }

    fn insert(&mut self, hash: ContentHash, location: ChunkLocation) -> DedupResult<bool> {
        let bucket = &self.buckets[hash.first_byte() as usize];
        let pos = match Self::search(bucket, &hash) {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        let slot = self.locations.len() as u32;
        self.locations.push(Some(location));
        self.buckets[hash.first_byte() as usize].insert(pos, Record { hash, slot });
        self.live += 1;
        Ok(true)
    }

    fn relocate(
        &mut self,
        volume: &VolumeName,
        from: &SessionName,
        to: &SessionName,
        survives: &dyn Fn(ChunkAddr) -> bool,
    ) -> DedupResult<usize> {
        Ok(self.retain(|loc| {
            if loc.volume != *volume || loc.session != *from {
                return true;
            }
            if survives(loc.addr) {
                loc.session = *to;
                true
            } else {
                false
            }
        }))
    }

    fn remove_volume(&mut self, volume: &VolumeName) -> DedupResult<usize> {
        Ok(self.retain(|loc| loc.volume != *volume))
    }

    fn len(&self) -> DedupResult<usize> {
        Ok(self.live)
    }

    fn clear(&mut self) -> DedupResult<()> {
        *self = Self::new();
        Ok(())
    }
}
