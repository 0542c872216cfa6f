//! Collaborators around the engine: snapshot generations of the source
//! volumes and the producer of block-level diffs between them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use vbak_digest::{DiffEvent, DiffKind, DiffReport};
use vbak_types::VolumeName;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Byte-seekable volume contents.
pub trait VolumeReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> VolumeReader for T {}

/// Which snapshot generation of a volume to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Captured for the run in progress.
    Current,
    /// Captured by the last completed monitor or send.
    Previous,
}

/// Two generations of every source volume.
pub trait SnapshotProvider: Send + Sync {
    fn current_size(&self, volume: &VolumeName) -> EngineResult<u64>;

    fn open_readable(
        &self,
        volume: &VolumeName,
        generation: Generation,
    ) -> EngineResult<Box<dyn VolumeReader>>;

    fn has_previous(&self, volume: &VolumeName) -> EngineResult<bool>;

    /// Make the current generation the previous one.
    fn rotate(&self, volume: &VolumeName) -> EngineResult<()>;

    /// Drop the previous generation.
    fn remove_previous(&self, volume: &VolumeName) -> EngineResult<()>;
}

/// Changed and freed block ranges between a volume's two generations.
pub trait DiffProducer: Send + Sync {
    fn diff(&self, volume: &VolumeName) -> EngineResult<DiffReport>;
}

/// Size of a file or block device.
fn stream_size(file: &mut File) -> io::Result<u64> {
    let size = file.seek(SeekFrom::End(0))?;
    file.rewind()?;
    Ok(size)
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
struct ImagePaths {
    current: PathBuf,
    previous: PathBuf,
}

/// Generations kept as image files (or a block device for the current one).
///
/// Rotating copies the current image over the previous one through a
/// temporary file and a rename.
#[derive(Debug, Clone, Default)]
pub struct ImageSnapshots {
    volumes: HashMap<VolumeName, ImagePaths>,
}

impl ImageSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut snapshots = Self::new();
        for volume in &config.volumes {
            snapshots.add(volume.name.clone(), &volume.current, config.previous_path(volume));
        }
        snapshots
    }

    pub fn add(
        &mut self,
        volume: VolumeName,
        current: impl Into<PathBuf>,
        previous: impl Into<PathBuf>,
    ) {
        self.volumes.insert(
            volume,
            ImagePaths {
                current: current.into(),
                previous: previous.into(),
            },
        );
    }

    fn paths(&self, volume: &VolumeName) -> EngineResult<&ImagePaths> {
        self.volumes
            .get(volume)
            .ok_or_else(|| EngineError::UnknownVolume(volume.to_string()))
    }

    pub fn current_path(&self, volume: &VolumeName) -> EngineResult<&Path> {
        Ok(&self.paths(volume)?.current)
    }

    pub fn previous_path(&self, volume: &VolumeName) -> EngineResult<&Path> {
        Ok(&self.paths(volume)?.previous)
    }
}

impl SnapshotProvider for ImageSnapshots {
    fn current_size(&self, volume: &VolumeName) -> EngineResult<u64> {
        Ok(stream_size(&mut File::open(&self.paths(volume)?.current)?)?)
    }

    fn open_readable(
        &self,
        volume: &VolumeName,
        generation: Generation,
    ) -> EngineResult<Box<dyn VolumeReader>> {
        let paths = self.paths(volume)?;
        let path = match generation {
            Generation::Current => &paths.current,
            Generation::Previous => &paths.previous,
        };
        Ok(Box::new(File::open(path)?))
    }

    fn has_previous(&self, volume: &VolumeName) -> EngineResult<bool> {
        Ok(self.paths(volume)?.previous.exists())
    }

    fn rotate(&self, volume: &VolumeName) -> EngineResult<()> {
        let paths = self.paths(volume)?;
        let dir = paths.previous.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut source = File::open(&paths.current)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        io::copy(&mut source, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&paths.previous).map_err(|e| e.error)?;
        debug!(volume = %volume, previous = %paths.previous.display(), "snapshot rotated");
        Ok(())
    }

    fn remove_previous(&self, volume: &VolumeName) -> EngineResult<()> {
        let paths = self.paths(volume)?;
        if paths.previous.exists() {
            fs::remove_file(&paths.previous)?;
        }
        Ok(())
    }
}

/// Finds changes by comparing both generations block by block.
pub struct CompareDiffProducer {
    snapshots: Arc<dyn SnapshotProvider>,
    granularity: u64,
}

impl CompareDiffProducer {
    pub fn new(snapshots: Arc<dyn SnapshotProvider>, granularity: u64) -> Self {
        Self {
            snapshots,
            granularity,
        }
    }

    fn push(events: &mut Vec<DiffEvent>, kind: DiffKind, offset: u64, length: u64) {
        if let Some(last) = events.last_mut() {
            if last.kind == kind && last.offset + last.length == offset {
                last.length += length;
                return;
            }
        }
        events.push(DiffEvent {
            kind,
            offset,
            length,
        });
    }
}

impl DiffProducer for CompareDiffProducer {
    fn diff(&self, volume: &VolumeName) -> EngineResult<DiffReport> {
        let mut previous = self.snapshots.open_readable(volume, Generation::Previous)?;
        let mut current = self.snapshots.open_readable(volume, Generation::Current)?;
        let g = self.granularity as usize;
        let mut old = vec![0u8; g];
        let mut new = vec![0u8; g];
        let mut events = Vec::new();
        let mut offset = 0u64;
        loop {
            let old_len = read_full(previous.as_mut(), &mut old)?;
            let new_len = read_full(current.as_mut(), &mut new)?;
            if old_len == 0 && new_len == 0 {
                break;
            }
            if new_len == 0 {
                Self::push(&mut events, DiffKind::Freed, offset, self.granularity);
            } else if old_len != new_len || old[..old_len] != new[..new_len] {
                Self::push(&mut events, DiffKind::Changed, offset, self.granularity);
            }
            offset += self.granularity;
        }
        debug!(volume = %volume, events = events.len(), "generations compared");
        Ok(DiffReport::new(self.granularity, events))
    }
}

/// Runs an external diff tool that prints a JSON [`DiffReport`].
pub struct CommandDiffProducer {
    argv: Vec<String>,
    snapshots: ImageSnapshots,
}

impl CommandDiffProducer {
    pub fn new(argv: Vec<String>, snapshots: ImageSnapshots) -> Self {
        Self { argv, snapshots }
    }

    fn command_for(&self, volume: &VolumeName) -> EngineResult<Vec<String>> {
        let current = self.snapshots.current_path(volume)?.display().to_string();
        let previous = self.snapshots.previous_path(volume)?.display().to_string();
        Ok(self
            .argv
            .iter()
            .map(|arg| {
                arg.replace("{volume}", volume.as_str())
                    .replace("{current}", &current)
                    .replace("{previous}", &previous)
            })
            .collect())
    }
}

impl DiffProducer for CommandDiffProducer {
    fn diff(&self, volume: &VolumeName) -> EngineResult<DiffReport> {
        let argv = self.command_for(volume)?;
        let fail = |reason: String| EngineError::DiffSource {
            volume: volume.clone(),
            reason,
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| fail("empty diff command".into()))?;
        info!(volume = %volume, program = %program, "running diff tool");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| fail(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(fail(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        DiffReport::from_json(&output.stdout).map_err(|e| fail(e.to_string()))
    }
}

/// Serves pre-computed reports; volumes without one fail.
#[derive(Debug, Clone, Default)]
pub struct StaticDiffProducer {
    reports: Arc<RwLock<HashMap<VolumeName, Result<DiffReport, String>>>>,
}

impl StaticDiffProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, volume: &VolumeName, report: DiffReport) {
        self.reports
            .write()
            .expect("lock poisoned")
            .insert(volume.clone(), Ok(report));
    }

    /// Make the next diffs of `volume` fail with `reason`.
    pub fn fail(&self, volume: &VolumeName, reason: &str) {
        self.reports
            .write()
            .expect("lock poisoned")
            .insert(volume.clone(), Err(reason.to_string()));
    }
}

impl DiffProducer for StaticDiffProducer {
    fn diff(&self, volume: &VolumeName) -> EngineResult<DiffReport> {
        let reports = self.reports.read().expect("lock poisoned");
        match reports.get(volume) {
            Some(Ok(report)) => Ok(report.clone()),
            Some(Err(reason)) => Err(EngineError::DiffSource {
                volume: volume.clone(),
                reason: reason.clone(),
            }),
            None => Err(EngineError::DiffSource {
                volume: volume.clone(),
                reason: "no diff report available".into(),
            }),
        }
    }
}
