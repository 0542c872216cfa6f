use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vbak_manifest::Manifest;
use vbak_types::{ChunkAddr, ContentHash, SessionName, VolumeName};

use crate::bucket::BucketIndex;
use crate::error::DedupResult;
use crate::memory::MemoryIndex;
use crate::sqlite::SqliteIndex;

/// Where a stored chunk first appeared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkLocation {
    pub volume: VolumeName,
    pub session: SessionName,
    pub addr: ChunkAddr,
}

impl ChunkLocation {
    pub fn new(volume: VolumeName, session: SessionName, addr: ChunkAddr) -> Self {
        Self {
            volume,
            session,
            addr,
        }
    }

    /// Destination path of the chunk relative to the archive root.
    pub fn storage_path(&self) -> String {
        format!("{}/{}/{}", self.volume, self.session, self.addr.storage_path())
    }
}

/// A hash -> first-location index.
pub trait ContentIndex: Send {
    /// Location of the first stored chunk with this hash.
    fn lookup(&self, hash: &ContentHash) -> DedupResult<Option<ChunkLocation>>;

    /// Record a location. Returns `false` if the hash was already indexed
    /// (the existing location is kept).
    fn insert(&mut self, hash: ContentHash, location: ChunkLocation) -> DedupResult<bool>;

    /// Reassign every entry stored in `from` to `to` when `survives(addr)`
    /// holds, and drop the others. Returns the number of dropped entries.
    fn relocate(
        &mut self,
        volume: &VolumeName,
        from: &SessionName,
        to: &SessionName,
        survives: &dyn Fn(ChunkAddr) -> bool,
    ) -> DedupResult<usize>;

    /// Drop every entry of a volume. Returns the number of dropped entries.
    fn remove_volume(&mut self, volume: &VolumeName) -> DedupResult<usize>;

    /// Number of indexed hashes.
    fn len(&self) -> DedupResult<usize>;

    fn is_empty(&self) -> DedupResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop all entries.
    fn clear(&mut self) -> DedupResult<()>;

    /// Opaque description of the archive state the index was built for.
    /// Only persistent backends remember it.
    fn stamp(&self) -> DedupResult<Option<String>> {
        Ok(None)
    }

    fn set_stamp(&mut self, _stamp: &str) -> DedupResult<()> {
        Ok(())
    }
}

/// Backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    Memory,
    Bucket,
    Sqlite {
        /// Database file; an in-memory database when absent.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

/// Construct an empty (or, for a persisted SQLite file, previously filled)
/// index of the given kind.
pub fn open_index(kind: &IndexKind) -> DedupResult<Box<dyn ContentIndex>> {
    Ok(match kind {
        IndexKind::Memory => Box::new(MemoryIndex::new()),
        IndexKind::Bucket => Box::new(BucketIndex::new()),
        IndexKind::Sqlite { path: Some(path) } => Box::new(SqliteIndex::open(path)?),
        IndexKind::Sqlite { path: None } => Box::new(SqliteIndex::open_memory()?),
    })
}

/// Index every stored chunk of one volume's sessions, given oldest first
/// so the earliest occurrence of a hash wins. Returns the number of new
/// entries.
pub fn populate<'a>(
    index: &mut dyn ContentIndex,
    volume: &VolumeName,
    sessions: impl IntoIterator<Item = (SessionName, &'a Manifest)>,
) -> DedupResult<usize> {
    let mut added = 0;
    for (session, manifest) in sessions {
        for entry in manifest.iter() {
            if let Some(hash) = entry.hash {
                let location = ChunkLocation::new(volume.clone(), session, entry.addr);
                if index.insert(hash, location)? {
                    added += 1;
                }
            }
        }
    }
    debug!(volume = %volume, added, "dedup index populated");
    Ok(added)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Behaviour shared by every backend.

    use super::*;
    use vbak_manifest::ManifestEntry;

    pub fn vol(name: &str) -> VolumeName {
        VolumeName::new(name).unwrap()
    }

    pub fn session(day: u32) -> SessionName {
        format!("S_202405{day:02}-000000").parse().unwrap()
    }

    pub fn addr(i: u64) -> ChunkAddr {
        ChunkAddr::from_index(i, 65536)
    }

    pub fn loc(v: &str, day: u32, i: u64) -> ChunkLocation {
        ChunkLocation::new(vol(v), session(day), addr(i))
    }

    pub fn h(tag: &str) -> ContentHash {
        ContentHash::of(tag.as_bytes())
    }

    pub fn first_insert_wins(index: &mut dyn ContentIndex) {
        assert!(index.is_empty().unwrap());
        assert!(index.insert(h("a"), loc("root", 1, 0)).unwrap());
        assert!(!index.insert(h("a"), loc("root", 2, 5)).unwrap());
        assert_eq!(index.lookup(&h("a")).unwrap(), Some(loc("root", 1, 0)));
        assert_eq!(index.lookup(&h("b")).unwrap(), None);
        assert_eq!(index.len().unwrap(), 1);
    }

    pub fn relocation(index: &mut dyn ContentIndex) {
        index.insert(h("a"), loc("root", 1, 0)).unwrap();
        index.insert(h("b"), loc("root", 1, 1)).unwrap();
        index.insert(h("c"), loc("root", 2, 2)).unwrap();
        index.insert(h("d"), loc("home", 1, 0)).unwrap();

        let dropped = index
            .relocate(&vol("root"), &session(1), &session(2), &|a| a == addr(0))
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(index.lookup(&h("a")).unwrap(), Some(loc("root", 2, 0)));
        assert_eq!(index.lookup(&h("b")).unwrap(), None);
        assert_eq!(index.lookup(&h("c")).unwrap(), Some(loc("root", 2, 2)));
        assert_eq!(index.lookup(&h("d")).unwrap(), Some(loc("home", 1, 0)));
        assert_eq!(index.len().unwrap(), 3);
    }

    pub fn volume_removal(index: &mut dyn ContentIndex) {
        index.insert(h("a"), loc("root", 1, 0)).unwrap();
        index.insert(h("b"), loc("home", 1, 0)).unwrap();
        assert_eq!(index.remove_volume(&vol("root")).unwrap(), 1);
        assert_eq!(index.lookup(&h("a")).unwrap(), None);
        index.clear().unwrap();
        assert!(index.is_empty().unwrap());
    }

    pub fn population(index: &mut dyn ContentIndex) {
        let s1 = Manifest::from_entries(vec![
            ManifestEntry::stored(addr(0), h("a")),
            ManifestEntry::zero(addr(1)),
        ])
        .unwrap();
        let s2 = Manifest::from_entries(vec![
            ManifestEntry::stored(addr(0), h("b")),
            ManifestEntry::stored(addr(1), h("a")),
        ])
        .unwrap();
        let added = populate(index, &vol("root"), [(session(1), &s1), (session(2), &s2)]).unwrap();
        assert_eq!(added, 2);
        assert_eq!(index.lookup(&h("a")).unwrap(), Some(loc("root", 1, 0)));
        assert_eq!(index.lookup(&h("b")).unwrap(), Some(loc("root", 2, 0)));
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn storage_path_is_archive_relative() {
        assert_eq!(
            loc("root", 1, 1).storage_path(),
            "root/S_20240501-000000/000000000/x0000000000010000"
        );
    }

    #[test]
    fn index_kind_from_toml_like_json() {
        let kind: IndexKind = serde_json::from_str(r#"{"kind": "bucket"}"#).unwrap();
        assert_eq!(kind, IndexKind::Bucket);
        let kind: IndexKind = serde_json::from_str(r#"{"kind": "sqlite"}"#).unwrap();
        assert_eq!(kind, IndexKind::Sqlite { path: None });
    }

    #[test]
    fn every_backend_behaves_alike() {
        for kind in [
            IndexKind::Memory,
            IndexKind::Bucket,
            IndexKind::Sqlite { path: None },
        ] {
            first_insert_wins(open_index(&kind).unwrap().as_mut());
            relocation(open_index(&kind).unwrap().as_mut());
            volume_removal(open_index(&kind).unwrap().as_mut());
            population(open_index(&kind).unwrap().as_mut());
        }
    }
}
