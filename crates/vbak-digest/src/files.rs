use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::dirty_map::DirtyMap;
use crate::error::{DigestError, DigestResult};
use crate::events::{apply_report, DiffReport, DigestOutcome};

const MAP_FILE: &str = "deltamap";
const TEMP_FILE: &str = "deltamap-tmp";
const NEW_FILE: &str = "deltamap-new";

/// The on-disk dirty map of one volume and its lifecycle.
#[derive(Debug, Clone)]
pub struct MapFiles {
    map: PathBuf,
    temp: PathBuf,
    fresh: PathBuf,
}

impl MapFiles {
    /// Map files inside a volume's metadata directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            map: dir.join(MAP_FILE),
            temp: dir.join(TEMP_FILE),
            fresh: dir.join(NEW_FILE),
        }
    }

    pub fn map_path(&self) -> &Path {
        &self.map
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Whether any map (canonical or in-flight) exists.
    pub fn exists(&self) -> bool {
        self.map.exists() || self.temp.exists()
    }

    /// Whether a mutation was left unfinished.
    pub fn is_pending(&self) -> bool {
        self.temp.exists()
    }

    /// Adopt an in-flight map as canonical. Returns `true` if one was found.
    pub fn recover(&self) -> DigestResult<bool> {
        if self.fresh.exists() {
            fs::remove_file(&self.fresh)?;
        }
        if !self.temp.exists() {
            return Ok(false);
        }
        warn!(path = %self.temp.display(), "adopting interrupted dirty map update");
        fs::rename(&self.temp, &self.map)?;
        Ok(true)
    }

    /// Open the current map, preferring an in-flight one.
    pub fn open_current(&self, chunks: u64) -> DigestResult<DirtyMap> {
        if self.temp.exists() {
            DirtyMap::open(&self.temp, chunks)
        } else {
            DirtyMap::open(&self.map, chunks)
        }
    }

    /// Move the canonical map aside for mutation and open it.
    pub fn begin_update(&self, chunks: u64) -> DigestResult<DirtyMap> {
        if !self.temp.exists() {
            if !self.map.exists() {
                return Err(DigestError::MissingMap(self.map.clone()));
            }
            fs::rename(&self.map, &self.temp)?;
        }
        DirtyMap::open(&self.temp, chunks)
    }

    /// Apply a diff report to the volume's map.
    ///
    /// The map is left in its in-flight location; callers finish the cycle
    /// with [`MapFiles::finalize`] or, after a committed send, [`MapFiles::reset`].
    pub fn digest(
        &self,
        report: &DiffReport,
        chunk_size: u64,
        chunks: u64,
    ) -> DigestResult<DigestOutcome> {
        report.validate(chunk_size)?;
        let mut map = self.begin_update(chunks)?;
        let outcome = apply_report(&mut map, report, chunk_size)?;
        map.flush()?;
        info!(
            map = %self.map.display(),
            chunks_marked = outcome.chunks_marked,
            "dirty map updated"
        );
        Ok(outcome)
    }

    /// Make an in-flight map canonical again.
    pub fn finalize(&self) -> DigestResult<()> {
        if self.temp.exists() {
            fs::rename(&self.temp, &self.map)?;
            debug!(path = %self.map.display(), "dirty map finalized");
        }
        Ok(())
    }

    /// Atomically replace the map with an all-clear one.
    pub fn reset(&self, chunks: u64) -> DigestResult<()> {
        let map = DirtyMap::create(&self.fresh, chunks)?;
        map.flush()?;
        drop(map);
        fs::rename(&self.fresh, &self.map)?;
        if self.temp.exists() {
            fs::remove_file(&self.temp)?;
        }
        debug!(path = %self.map.display(), chunks, "dirty map reset");
        Ok(())
    }

    /// Remove every map file.
    pub fn remove(&self) -> DigestResult<()> {
        for path in [&self.map, &self.temp, &self.fresh] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DiffEvent;

    const CS: u64 = 64 * 1024;

    fn report(events: Vec<DiffEvent>) -> DiffReport {
        DiffReport::new(4096, events)
    }

    #[test]
    fn digest_requires_map() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        let err = files.digest(&report(vec![]), CS, 8).unwrap_err();
        assert!(matches!(err, DigestError::MissingMap(_)));
    }

    #[test]
    fn digest_then_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();

        files
            .digest(&report(vec![DiffEvent::changed(2 * CS, 4096)]), CS, 8)
            .unwrap();
        assert!(files.is_pending());
        assert!(!files.map_path().exists());

        files.finalize().unwrap();
        assert!(!files.is_pending());
        let map = files.open_current(8).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn digests_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();
        files.digest(&report(vec![DiffEvent::changed(0, 4096)]), CS, 8).unwrap();
        files.finalize().unwrap();
        files.digest(&report(vec![DiffEvent::freed(5 * CS, 4096)]), CS, 8).unwrap();
        files.finalize().unwrap();
        let map = files.open_current(8).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn empty_digest_leaves_bits_alone() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();
        files.digest(&report(vec![DiffEvent::changed(CS, 4096)]), CS, 8).unwrap();
        files.finalize().unwrap();
        let outcome = files.digest(&report(vec![]), CS, 8).unwrap();
        files.finalize().unwrap();
        assert!(!outcome.has_changes());
        assert_eq!(files.open_current(8).unwrap().iter_set().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn crash_during_digest_is_rolled_forward() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();
        files.digest(&report(vec![DiffEvent::changed(3 * CS, 4096)]), CS, 8).unwrap();
        // no finalize: simulated crash

        let files = MapFiles::in_dir(dir.path());
        assert!(files.recover().unwrap());
        assert!(!files.recover().unwrap());
        assert!(files.map_path().exists());
        assert_eq!(files.open_current(8).unwrap().iter_set().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn reset_clears_in_flight_map() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();
        files.digest(&report(vec![DiffEvent::changed(0, 4096)]), CS, 8).unwrap();
        files.reset(8).unwrap();
        assert!(!files.is_pending());
        assert!(files.open_current(8).unwrap().is_clear());
    }

    #[test]
    fn remove_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let files = MapFiles::in_dir(dir.path());
        files.reset(8).unwrap();
        files.begin_update(8).unwrap();
        files.remove().unwrap();
        assert!(!files.exists());
    }
}
