use std::fs;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vbak_chain::{MetaStore, PruneSelector, SessionRecord};
use vbak_dedup::{open_index, populate, ContentIndex};
use vbak_store::Destination;
use vbak_types::{SessionName, VolumeName};

use crate::config::EngineConfig;
use crate::context::{volume_record_path, EngineContext, VOLUME_FILE};
use crate::error::{EngineError, EngineResult};
use crate::lock::InstanceLock;
use crate::monitor::monitor_volume;
use crate::provider::{
    CommandDiffProducer, CompareDiffProducer, DiffProducer, ImageSnapshots, SnapshotProvider,
};
use crate::prune::prune_volume;
use crate::receive::{receive_volume, ReceiveMode};
use crate::report::{BatchOutcome, MonitorReport, PruneReport, ReceiveReport, SendReport};
use crate::send::send_volume;

/// Index stamp while an operation that mutates the archive is running.
const STALE_STAMP: &str = "stale";

/// The collaborators every operation borrows from the engine.
pub(crate) struct Services<'a> {
    pub destination: &'a dyn Destination,
    pub snapshots: &'a dyn SnapshotProvider,
    pub diff: &'a dyn DiffProducer,
    pub compression_level: i32,
}

/// Backup engine over one archive directory and one destination.
///
/// Holds the instance lock for its whole lifetime. Every operation opens
/// the volume's context first, which completes or discards work left
/// behind by an interrupted run.
pub struct Engine {
    config: EngineConfig,
    destination: Box<dyn Destination>,
    snapshots: Arc<dyn SnapshotProvider>,
    diff: Box<dyn DiffProducer>,
    index: Option<Box<dyn ContentIndex>>,
    _lock: InstanceLock,
}

impl Engine {
    /// Open the engine described by a configuration: take the instance
    /// lock, connect the destination, and set up snapshot and diff sources.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let images = ImageSnapshots::from_config(&config);
        let snapshots: Arc<dyn SnapshotProvider> = Arc::new(images.clone());
        let diff: Box<dyn DiffProducer> = match &config.diff.command {
            Some(argv) => Box::new(CommandDiffProducer::new(argv.clone(), images)),
            None => Box::new(CompareDiffProducer::new(
                snapshots.clone(),
                config.diff.granularity,
            )),
        };
        let destination = config.open_destination();
        Self::with_parts(config, destination, snapshots, diff)
    }

    /// Assemble an engine from explicit collaborators.
    pub fn with_parts(
        config: EngineConfig,
        destination: Box<dyn Destination>,
        snapshots: Arc<dyn SnapshotProvider>,
        diff: Box<dyn DiffProducer>,
    ) -> EngineResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.archive_dir)?;
        let lock = InstanceLock::acquire(&config.lock_path())?;
        info!(
            archive = %config.archive_dir.display(),
            destination = %destination.describe(),
            "engine opened"
        );
        Ok(Self {
            config,
            destination,
            snapshots,
            diff,
            index: None,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn destination(&self) -> &dyn Destination {
        self.destination.as_ref()
    }

    /// Open (and recover) the context of one volume.
    pub fn context(&self, volume: &VolumeName) -> EngineResult<EngineContext> {
        EngineContext::open(
            &self.config.archive_dir,
            volume,
            self.destination.as_ref(),
            self.config.chunk_size,
        )
    }

    fn services(&self) -> Services<'_> {
        Services {
            destination: self.destination.as_ref(),
            snapshots: self.snapshots.as_ref(),
            diff: self.diff.as_ref(),
            compression_level: self.config.compression_level,
        }
    }

    // ---- Operations ----

    /// Record changes since the previous monitor or send.
    pub fn monitor(&mut self, volume: &VolumeName) -> EngineResult<MonitorReport> {
        let mut ctx = self.context(volume)?;
        monitor_volume(&self.services(), &mut ctx)
    }

    /// Send the volume's changes as a new session.
    pub fn send(&mut self, volume: &VolumeName) -> EngineResult<SendReport> {
        let mut ctx = self.context(volume)?;
        self.prepare_index()?;
        let services = Services {
            destination: self.destination.as_ref(),
            snapshots: self.snapshots.as_ref(),
            diff: self.diff.as_ref(),
            compression_level: self.config.compression_level,
        };
        let result = send_volume(&services, &mut ctx, &mut self.index);
        if result.is_ok() {
            self.refresh_stamp()?;
        }
        result
    }

    /// Reconstruct a session (the newest when `session` is `None`) and
    /// extract, verify, or compare it.
    pub fn receive(
        &mut self,
        volume: &VolumeName,
        session: Option<SessionName>,
        mode: ReceiveMode<'_>,
    ) -> EngineResult<ReceiveReport> {
        let mut ctx = self.context(volume)?;
        receive_volume(&self.services(), &mut ctx, session, mode)
    }

    pub fn verify(
        &mut self,
        volume: &VolumeName,
        session: Option<SessionName>,
    ) -> EngineResult<ReceiveReport> {
        self.receive(volume, session, ReceiveMode::Verify)
    }

    pub fn diff(
        &mut self,
        volume: &VolumeName,
        session: Option<SessionName>,
        remap: bool,
    ) -> EngineResult<ReceiveReport> {
        self.receive(volume, session, ReceiveMode::Diff { remap })
    }

    /// Remove sessions by merging them into their successor.
    pub fn prune(
        &mut self,
        volume: &VolumeName,
        selector: &PruneSelector,
    ) -> EngineResult<PruneReport> {
        let mut ctx = self.context(volume)?;
        self.prepare_index()?;
        let services = Services {
            destination: self.destination.as_ref(),
            snapshots: self.snapshots.as_ref(),
            diff: self.diff.as_ref(),
            compression_level: self.config.compression_level,
        };
        let result = prune_volume(&services, &mut ctx, selector, &mut self.index);
        match &result {
            Ok(_) => self.refresh_stamp()?,
            // Relocations may be half applied; rebuild on next use.
            Err(_) => self.index = None,
        }
        result
    }

    /// Volumes with local metadata in the archive directory, sorted.
    pub fn list_volumes(&self) -> EngineResult<Vec<VolumeName>> {
        let mut volumes = Vec::new();
        if !self.config.archive_dir.exists() {
            return Ok(volumes);
        }
        for entry in fs::read_dir(&self.config.archive_dir)? {
            let entry = entry?;
            if !entry.path().join(VOLUME_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                match VolumeName::new(name) {
                    Ok(volume) => volumes.push(volume),
                    Err(e) => warn!(dir = %name, error = %e, "skipping unrecognized directory"),
                }
            }
        }
        volumes.sort();
        Ok(volumes)
    }

    /// Committed sessions of a volume, oldest first.
    pub fn list_sessions(&self, volume: &VolumeName) -> EngineResult<Vec<SessionRecord>> {
        let ctx = self.context(volume)?;
        ctx.require_archived()?;
        Ok(ctx.chain.iter().cloned().collect())
    }

    /// Remove every trace of a volume: its destination directory, local
    /// metadata, index entries, and previous snapshot.
    pub fn delete_volume(&mut self, volume: &VolumeName) -> EngineResult<()> {
        let meta = self.meta(volume);
        let remote = self.destination.exists(&volume_record_path(volume))?;
        if !meta.exists() && !remote {
            return Err(EngineError::UnknownVolume(volume.to_string()));
        }
        self.destination.remove(volume.as_str())?;
        if meta.dir().exists() {
            fs::remove_dir_all(meta.dir())?;
        }
        if let Some(index) = self.index.as_deref_mut() {
            index.remove_volume(volume)?;
        }
        match self.snapshots.remove_previous(volume) {
            Ok(()) | Err(EngineError::UnknownVolume(_)) => {}
            Err(e) => return Err(e),
        }
        self.refresh_stamp()?;
        info!(volume = %volume, "volume deleted");
        Ok(())
    }

    // ---- Batches ----

    pub fn monitor_all(
        &mut self,
        volumes: &[VolumeName],
    ) -> EngineResult<BatchOutcome<MonitorReport>> {
        self.run_batch(volumes, |engine, volume| engine.monitor(volume))
    }

    pub fn send_all(&mut self, volumes: &[VolumeName]) -> EngineResult<BatchOutcome<SendReport>> {
        self.run_batch(volumes, |engine, volume| engine.send(volume))
    }

    /// Run `op` over each volume. Input and diff-source failures are
    /// collected; any other failure stops the batch.
    fn run_batch<T>(
        &mut self,
        volumes: &[VolumeName],
        mut op: impl FnMut(&mut Self, &VolumeName) -> EngineResult<T>,
    ) -> EngineResult<BatchOutcome<T>> {
        let mut outcome = BatchOutcome::default();
        for volume in volumes {
            match op(self, volume) {
                Ok(result) => outcome.completed.push((volume.clone(), result)),
                Err(e) if e.is_per_volume() => {
                    warn!(volume = %volume, class = %e.class(), error = %e, "volume skipped");
                    outcome.failed.push((volume.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    // ---- Dedup index ----

    fn meta(&self, volume: &VolumeName) -> MetaStore {
        MetaStore::new(self.config.archive_dir.join(volume.as_str()))
    }

    /// Describes the committed state of every volume, so a persisted index
    /// can tell whether it is still current.
    fn archive_stamp(&self) -> EngineResult<String> {
        let mut stamp = String::new();
        for volume in self.list_volumes()? {
            let meta = self.meta(&volume);
            let Some(record) = meta.load_volume()? else {
                continue;
            };
            let (committed, _) = meta.list_sessions()?;
            let name =
                |s: Option<SessionName>| s.map_or_else(|| "-".to_string(), |s| s.to_string());
            stamp.push_str(&format!(
                "{volume}={}..{}#{};",
                name(record.first),
                name(record.last),
                committed.len()
            ));
        }
        Ok(stamp)
    }

    /// Make the configured index ready for an operation that mutates the
    /// archive: open it and fill it from the local manifests unless a
    /// persisted index already matches the archive, then clear its stamp
    /// until [`Engine::refresh_stamp`] runs.
    fn prepare_index(&mut self) -> EngineResult<()> {
        if self.index.is_none() {
            self.index = self.load_index()?;
        }
        if let Some(index) = self.index.as_deref_mut() {
            index.set_stamp(STALE_STAMP)?;
        }
        Ok(())
    }

    fn load_index(&self) -> EngineResult<Option<Box<dyn ContentIndex>>> {
        let Some(kind) = &self.config.dedup else {
            return Ok(None);
        };
        let mut index = open_index(kind)?;
        let stamp = self.archive_stamp()?;
        if index.stamp()?.as_deref() == Some(stamp.as_str()) {
            debug!(entries = index.len()?, "reusing persisted dedup index");
        } else {
            index.clear()?;
            for volume in self.list_volumes()? {
                let meta = self.meta(&volume);
                let chain = meta.load_chain()?;
                let manifests = chain
                    .names()
                    .iter()
                    .map(|name| Ok((*name, meta.load_manifest(name)?)))
                    .collect::<EngineResult<Vec<_>>>()?;
                populate(
                    index.as_mut(),
                    &volume,
                    manifests.iter().map(|(name, manifest)| (*name, manifest)),
                )?;
            }
            info!(entries = index.len()?, "dedup index built");
        }
        Ok(Some(index))
    }

    fn refresh_stamp(&mut self) -> EngineResult<()> {
        if self.index.is_none() {
            return Ok(());
        }
        let stamp = self.archive_stamp()?;
        if let Some(index) = self.index.as_deref_mut() {
            index.set_stamp(&stamp)?;
        }
        Ok(())
    }
}
