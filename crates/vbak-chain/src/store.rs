use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use vbak_manifest::{KeyValueRecord, Manifest};
use vbak_types::SessionName;

use crate::chain::SessionChain;
use crate::error::ChainResult;
use crate::record::{SessionRecord, VolumeRecord};

/// File name of the volume record.
pub const VOLUME_FILE: &str = "volinfo";
/// File name of a session record inside its directory.
pub const INFO_FILE: &str = "info";
/// File name of a session manifest inside its directory.
pub const MANIFEST_FILE: &str = "manifest";

/// Write `data` to `path` through a temporary file in the same directory
/// and an atomic rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Local metadata of one volume: its record, session records, and
/// manifests.
///
/// ```text
/// <dir>/volinfo
/// <dir>/S_20240101-120000/info
/// <dir>/S_20240101-120000/manifest
/// <dir>/S_20240102-120000-tmp/...      (uncommitted)
/// ```
#[derive(Debug, Clone)]
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(VOLUME_FILE).exists()
    }

    pub fn session_dir(&self, name: &SessionName) -> PathBuf {
        self.dir.join(name.to_string())
    }

    pub fn temp_dir(&self, name: &SessionName) -> PathBuf {
        self.dir.join(name.temp_name())
    }

    pub fn load_volume(&self) -> ChainResult<Option<VolumeRecord>> {
        let path = self.dir.join(VOLUME_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let record = KeyValueRecord::from_bytes(&fs::read(path)?)?;
        Ok(Some(VolumeRecord::from_record(&record)?))
    }

    pub fn save_volume(&self, volume: &VolumeRecord) -> ChainResult<()> {
        write_atomic(&self.dir.join(VOLUME_FILE), &volume.to_record().to_bytes())?;
        debug!(dir = %self.dir.display(), last = ?volume.last, "volume record saved");
        Ok(())
    }

    /// Read the record stored in a session directory.
    pub fn load_session_at(&self, dir: &Path, name: SessionName) -> ChainResult<SessionRecord> {
        let record = KeyValueRecord::from_bytes(&fs::read(dir.join(INFO_FILE))?)?;
        Ok(SessionRecord::from_record(name, &record)?)
    }

    pub fn load_session(&self, name: &SessionName) -> ChainResult<SessionRecord> {
        self.load_session_at(&self.session_dir(name), *name)
    }

    /// Write a session record into `dir` (committed or temporary).
    pub fn save_session_at(&self, dir: &Path, record: &SessionRecord) -> ChainResult<()> {
        write_atomic(&dir.join(INFO_FILE), &record.to_record().to_bytes())?;
        Ok(())
    }

    pub fn load_manifest_at(&self, dir: &Path) -> ChainResult<Manifest> {
        let file = fs::File::open(dir.join(MANIFEST_FILE))?;
        Ok(Manifest::read(BufReader::new(file))?)
    }

    pub fn load_manifest(&self, name: &SessionName) -> ChainResult<Manifest> {
        self.load_manifest_at(&self.session_dir(name))
    }

    pub fn save_manifest_at(&self, dir: &Path, manifest: &Manifest) -> ChainResult<()> {
        write_atomic(&dir.join(MANIFEST_FILE), &manifest.to_bytes()?)?;
        Ok(())
    }

    /// Committed and uncommitted session directories, each sorted.
    pub fn list_sessions(&self) -> ChainResult<(Vec<SessionName>, Vec<SessionName>)> {
        let mut committed = Vec::new();
        let mut pending = Vec::new();
        if !self.dir.exists() {
            return Ok((committed, pending));
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(session) = SessionName::from_temp_name(name) {
                pending.push(session);
            } else if let Ok(session) = name.parse::<SessionName>() {
                committed.push(session);
            }
        }
        committed.sort();
        pending.sort();
        Ok((committed, pending))
    }

    /// Load every committed session and index them into a chain.
    pub fn load_chain(&self) -> ChainResult<SessionChain> {
        let (committed, _) = self.list_sessions()?;
        let records = committed
            .into_iter()
            .map(|name| self.load_session(&name))
            .collect::<ChainResult<Vec<_>>>()?;
        SessionChain::from_records(records)
    }

    pub fn remove_session_dir(&self, dir: &Path) -> ChainResult<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn rename_dir(&self, from: &Path, to: &Path) -> ChainResult<()> {
        fs::rename(from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbak_manifest::ManifestEntry;
    use vbak_types::{ChunkAddr, ContentHash};

    fn name(day: u32) -> SessionName {
        format!("S_202403{day:02}-101010").parse().unwrap()
    }

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn volume_record_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path().join("vol"));
        assert!(store.load_volume().unwrap().is_none());
        let mut vol = VolumeRecord::new();
        vol.last = Some(name(1));
        store.save_volume(&vol).unwrap();
        assert!(store.exists());
        assert_eq!(store.load_volume().unwrap().unwrap(), vol);
    }

    #[test]
    fn chain_loads_from_session_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        let mut chain = SessionChain::new();
        for day in [1, 2, 3] {
            let record = chain
                .append(SessionRecord::new(name(day), 1 << 20, 65536))
                .unwrap()
                .clone();
            store.save_session_at(&store.session_dir(&name(day)), &record).unwrap();
        }
        fs::create_dir_all(store.temp_dir(&name(4))).unwrap();
        fs::create_dir_all(dir.path().join("not-a-session")).unwrap();

        let (committed, pending) = store.list_sessions().unwrap();
        assert_eq!(committed, vec![name(1), name(2), name(3)]);
        assert_eq!(pending, vec![name(4)]);

        let loaded = store.load_chain().unwrap();
        assert_eq!(loaded.names(), chain.names());
        assert_eq!(loaded.last().unwrap().previous, Some(name(2)));
    }

    #[test]
    fn manifest_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        let manifest = Manifest::from_entries(vec![
            ManifestEntry::zero(ChunkAddr::new(0)),
            ManifestEntry::stored(ChunkAddr::new(65536), ContentHash::of(b"q")),
        ])
        .unwrap();
        let session_dir = store.session_dir(&name(1));
        store.save_manifest_at(&session_dir, &manifest).unwrap();
        assert_eq!(store.load_manifest(&name(1)).unwrap(), manifest);
    }
}
