use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vbak_dedup::IndexKind;
use vbak_store::{Destination, LocalDestination, ShellDestination, Transport};
use vbak_types::{ChunkAddr, VolumeName, DEFAULT_CHUNK_SIZE};

use crate::error::{EngineError, EngineResult};

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_compression_level() -> i32 {
    vbak_codec::DEFAULT_ZSTD_LEVEL
}

fn default_drain_timeout() -> u64 {
    20
}

fn default_granularity() -> u64 {
    4096
}

fn default_enabled() -> bool {
    true
}

/// Engine configuration, usually read from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local metadata directory: volume records, session records,
    /// manifests and dirty maps.
    pub archive_dir: PathBuf,
    /// Single-instance lock file; `<archive_dir>/vbak.lock` when absent.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Chunk size for new volumes. Volumes with sessions keep theirs.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    pub destination: DestinationConfig,
    /// Deduplication index; no deduplication when absent.
    #[serde(default)]
    pub dedup: Option<IndexKind>,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// A directory on this machine, written in-process.
    Local,
    /// A directory on this machine, written through `sh`.
    Shell,
    Ssh,
    Qubes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    /// Archive root on the destination host.
    pub path: PathBuf,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub vm: Option<String>,
    /// Seconds to wait for the destination to drain a stream once the
    /// producer has finished.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// How changed blocks between snapshot generations are found.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffConfig {
    /// External diff tool argv; `{volume}`, `{current}` and `{previous}`
    /// are substituted. When absent, generations are compared directly.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Block size for direct comparison.
    #[serde(default = "default_granularity")]
    pub granularity: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            command: None,
            granularity: default_granularity(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: VolumeName,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Image file or block device holding the current generation.
    pub current: PathBuf,
    /// Where the previous generation is kept;
    /// `<archive_dir>/<name>/previous.img` when absent.
    #[serde(default)]
    pub previous: Option<PathBuf>,
}

impl EngineConfig {
    /// A configuration with defaults and a local destination.
    pub fn new(archive_dir: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            lock_file: None,
            chunk_size: default_chunk_size(),
            compression_level: default_compression_level(),
            destination: DestinationConfig {
                kind: DestinationKind::Local,
                path: destination.into(),
                host: None,
                vm: None,
                drain_timeout_secs: default_drain_timeout(),
            },
            dedup: None,
            diff: DiffConfig::default(),
            volumes: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> EngineResult<()> {
        ChunkAddr::check_chunk_size(self.chunk_size)?;
        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::InvalidConfig(format!(
                "compression level {} outside 1..=22",
                self.compression_level
            )));
        }
        match self.destination.kind {
            DestinationKind::Ssh if self.destination.host.is_none() => {
                return Err(EngineError::InvalidConfig(
                    "ssh destination needs a host".into(),
                ))
            }
            DestinationKind::Qubes if self.destination.vm.is_none() => {
                return Err(EngineError::InvalidConfig("qubes destination needs a vm".into()))
            }
            _ => {}
        }
        if self.diff.granularity == 0 || self.chunk_size % self.diff.granularity != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "diff granularity {} does not divide chunk size {}",
                self.diff.granularity, self.chunk_size
            )));
        }
        if matches!(&self.diff.command, Some(argv) if argv.is_empty()) {
            return Err(EngineError::InvalidConfig("diff command is empty".into()));
        }
        let mut names: Vec<&VolumeName> = self.volumes.iter().map(|v| &v.name).collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(EngineError::InvalidConfig(format!(
                "volume {} configured twice",
                pair[0]
            )));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.archive_dir.join("vbak.lock"))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.destination.drain_timeout_secs)
    }

    pub fn volume(&self, name: &VolumeName) -> EngineResult<&VolumeConfig> {
        self.volumes
            .iter()
            .find(|v| v.name == *name)
            .ok_or_else(|| EngineError::UnknownVolume(name.to_string()))
    }

    /// Configured volumes that take part in batch runs.
    pub fn enabled_volumes(&self) -> Vec<VolumeName> {
        self.volumes
            .iter()
            .filter(|v| v.enabled)
            .map(|v| v.name.clone())
            .collect()
    }

    pub fn previous_path(&self, volume: &VolumeConfig) -> PathBuf {
        volume.previous.clone().unwrap_or_else(|| {
            self.archive_dir
                .join(volume.name.as_str())
                .join("previous.img")
        })
    }

    /// Construct the configured destination.
    pub fn open_destination(&self) -> Box<dyn Destination> {
        let dest = &self.destination;
        let root = dest.path.to_string_lossy().into_owned();
        let timeout = self.drain_timeout();
        match dest.kind {
            DestinationKind::Local => Box::new(LocalDestination::new(&dest.path, timeout)),
            DestinationKind::Shell => {
                Box::new(ShellDestination::new(Transport::Local, root, timeout))
            }
            DestinationKind::Ssh => Box::new(ShellDestination::new(
                Transport::Ssh {
                    host: dest.host.clone().unwrap_or_default(),
                },
                root,
                timeout,
            )),
            DestinationKind::Qubes => Box::new(ShellDestination::new(
                Transport::Qubes {
                    vm: dest.vm.clone().unwrap_or_default(),
                },
                root,
                timeout,
            )),
        }
    }
}
