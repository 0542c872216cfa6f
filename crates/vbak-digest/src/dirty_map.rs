use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{DigestError, DigestResult};

/// One bit per chunk, least significant bit first within each byte.
///
/// A map is either backed by a file (the durable per-volume map) or
/// anonymous (scratch maps, e.g. chunks that differ during a receive diff).
pub struct DirtyMap {
    mmap: MmapMut,
    chunks: u64,
    path: Option<PathBuf>,
}

impl DirtyMap {
    /// Bytes needed to hold `chunks` bits. Always at least one.
    pub fn byte_len(chunks: u64) -> u64 {
        chunks / 8 + 1
    }

    /// An all-clear map held in memory.
    pub fn anonymous(chunks: u64) -> DigestResult<Self> {
        let mmap = MmapMut::map_anon(Self::byte_len(chunks) as usize)?;
        Ok(Self {
            mmap,
            chunks,
            path: None,
        })
    }

    /// Create (or truncate) an all-clear map file.
    pub fn create(path: &Path, chunks: u64) -> DigestResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(Self::byte_len(chunks))?;
        Self::map_file(file, path, chunks)
    }

    /// Open an existing map file, growing it if the volume has grown.
    /// A map is never shrunk: bits past `chunks` are kept but ignored.
    pub fn open(path: &Path, chunks: u64) -> DigestResult<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DigestError::MissingMap(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let needed = Self::byte_len(chunks);
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        Self::map_file(file, path, chunks)
    }

    fn map_file(file: File, path: &Path, chunks: u64) -> DigestResult<Self> {
        // SAFETY: the map file is private to this process, which holds the
        // archive-wide instance lock for as long as the mapping lives.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            chunks,
            path: Some(path.to_path_buf()),
        })
    }

    /// Number of chunks tracked.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn check(&self, index: u64) -> DigestResult<()> {
        if index >= self.chunks {
            return Err(DigestError::OutOfRange {
                index,
                chunks: self.chunks,
            });
        }
        Ok(())
    }

    /// Whether chunk `index` is dirty. Indices past the end read as clear.
    pub fn get(&self, index: u64) -> bool {
        if index >= self.chunks {
            return false;
        }
        self.mmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Mark chunk `index` dirty.
    pub fn set(&mut self, index: u64) -> DigestResult<()> {
        self.check(index)?;
        self.mmap[(index / 8) as usize] |= 1 << (index % 8);
        Ok(())
    }

    /// Mark chunks `first..=last` dirty.
    pub fn set_range(&mut self, first: u64, last: u64) -> DigestResult<()> {
        self.check(last)?;
        for index in first..=last {
            self.mmap[(index / 8) as usize] |= 1 << (index % 8);
        }
        Ok(())
    }

    /// Number of dirty chunks.
    pub fn count(&self) -> u64 {
        self.iter_set().count() as u64
    }

    /// Whether no chunk is dirty.
    pub fn is_clear(&self) -> bool {
        self.iter_set().next().is_none()
    }

    /// Indices of dirty chunks in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        let chunks = self.chunks;
        self.mmap
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(i, byte)| {
                (0..8u64)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| i as u64 * 8 + bit)
            })
            .take_while(move |index| *index < chunks)
    }

    /// Flush a file-backed map to disk.
    pub fn flush(&self) -> DigestResult<()> {
        if self.path.is_some() {
            self.mmap.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DirtyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyMap")
            .field("chunks", &self.chunks)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_matches_layout() {
        assert_eq!(DirtyMap::byte_len(0), 1);
        assert_eq!(DirtyMap::byte_len(8), 2);
        assert_eq!(DirtyMap::byte_len(9), 2);
    }

    #[test]
    fn set_and_get() {
        let mut map = DirtyMap::anonymous(20).unwrap();
        assert!(map.is_clear());
        map.set(0).unwrap();
        map.set(9).unwrap();
        assert!(map.get(0));
        assert!(!map.get(1));
        assert!(map.get(9));
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![0, 9]);
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn bits_are_lsb_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deltamap");
        let mut map = DirtyMap::create(&path, 16).unwrap();
        map.set(1).unwrap();
        map.set(8).unwrap();
        map.flush().unwrap();
        drop(map);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0b10, 0b1, 0]);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut map = DirtyMap::anonymous(4).unwrap();
        assert!(matches!(map.set(4), Err(DigestError::OutOfRange { .. })));
        assert!(map.set_range(2, 10).is_err());
        assert!(!map.get(100));
    }

    #[test]
    fn range_marks_inclusive() {
        let mut map = DirtyMap::anonymous(32).unwrap();
        map.set_range(3, 11).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), (3..=11).collect::<Vec<_>>());
    }

    #[test]
    fn persists_across_open_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deltamap");
        {
            let mut map = DirtyMap::create(&path, 10).unwrap();
            map.set(7).unwrap();
            map.flush().unwrap();
        }
        let mut map = DirtyMap::open(&path, 100).unwrap();
        assert!(map.get(7));
        map.set(99).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), DirtyMap::byte_len(100));
    }

    #[test]
    fn open_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deltamap");
        {
            let mut map = DirtyMap::create(&path, 64).unwrap();
            map.set(60).unwrap();
            map.set(2).unwrap();
            map.flush().unwrap();
        }
        let map = DirtyMap::open(&path, 16).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![2]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), DirtyMap::byte_len(64));
    }

    #[test]
    fn open_missing_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirtyMap::open(&dir.path().join("nope"), 8).unwrap_err();
        assert!(matches!(err, DigestError::MissingMap(_)));
    }
}
