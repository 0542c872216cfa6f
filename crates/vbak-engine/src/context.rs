use std::path::Path;

use tracing::{info, warn};
use vbak_chain::{MetaStore, SessionChain, VolumeRecord};
use vbak_codec::{ChunkPipeline, ZstdCodec};
use vbak_digest::MapFiles;
use vbak_manifest::KeyValueRecord;
use vbak_store::Destination;
use vbak_types::{chunk_count, ChunkAddr, SessionName, VolumeName};

use crate::error::{EngineError, EngineResult};

/// Volume record file name, locally and on the destination.
pub const VOLUME_FILE: &str = vbak_chain::store::VOLUME_FILE;

/// Destination path of a committed session directory.
pub fn session_path(volume: &VolumeName, session: &SessionName) -> String {
    format!("{volume}/{session}")
}

/// Destination path of a session directory being sent.
pub fn temp_session_path(volume: &VolumeName, session: &SessionName) -> String {
    format!("{volume}/{}", session.temp_name())
}

/// Destination path of a stored chunk below a session directory.
pub fn chunk_path(session_dir: &str, addr: ChunkAddr) -> String {
    format!("{session_dir}/{}", addr.storage_path())
}

pub fn volume_record_path(volume: &VolumeName) -> String {
    format!("{volume}/{VOLUME_FILE}")
}

/// Everything one operation on one volume works with: the volume record,
/// its session chain, local metadata, and dirty map.
///
/// Opening a context finishes interrupted work: an in-flight dirty map is
/// adopted, temporary sessions are rolled forward or discarded, and a
/// committed session missing from the volume record is adopted.
#[derive(Debug)]
pub struct EngineContext {
    pub volume: VolumeName,
    pub record: VolumeRecord,
    pub chain: SessionChain,
    pub meta: MetaStore,
    pub maps: MapFiles,
    /// Chunk size of the archived sessions, or the configured size for a
    /// volume without sessions.
    pub chunk_size: u64,
    persisted: bool,
}

impl EngineContext {
    pub fn open(
        archive_dir: &Path,
        volume: &VolumeName,
        destination: &dyn Destination,
        default_chunk_size: u64,
    ) -> EngineResult<Self> {
        let meta = MetaStore::new(archive_dir.join(volume.as_str()));
        let maps = MapFiles::in_dir(meta.dir());
        let stored = meta.load_volume()?;
        if stored.as_ref().is_some_and(|r| r.meta_resync) {
            return Err(EngineError::state(
                volume,
                "a merge was interrupted; local and destination metadata may disagree",
            ));
        }
        if meta.dir().exists() {
            maps.recover()?;
            recover_sessions(&meta, volume, destination)?;
        }

        let chain = meta.load_chain()?;
        let persisted = stored.is_some();
        let mut ctx = Self {
            volume: volume.clone(),
            record: stored.unwrap_or_default(),
            chain,
            meta,
            maps,
            chunk_size: default_chunk_size,
            persisted,
        };
        ctx.reconcile(destination)?;
        if let Some(last) = ctx.chain.last() {
            if last.chunk_size != default_chunk_size {
                warn!(
                    volume = %volume,
                    archived = last.chunk_size,
                    configured = default_chunk_size,
                    "keeping the archived chunk size"
                );
            }
            ctx.chunk_size = last.chunk_size;
        }
        Ok(ctx)
    }

    /// Bring the volume record in line with the committed sessions.
    fn reconcile(&mut self, destination: &dyn Destination) -> EngineResult<()> {
        let chain_last = self.chain.last().map(|r| (r.name, r.previous));
        match chain_last {
            None if self.record.last.is_none() => Ok(()),
            None => Err(EngineError::state(
                &self.volume,
                format!(
                    "volume record names {:?} but no session directories exist",
                    self.record.last
                ),
            )),
            Some((last, _)) if Some(last) == self.record.last => Ok(()),
            Some((last, previous)) if previous == self.record.last => {
                warn!(volume = %self.volume, session = %last, "adopting committed session");
                self.record.first = self.chain.first().map(|r| r.name);
                self.record.last = Some(last);
                self.save_record(destination)
            }
            Some((last, _)) => Err(EngineError::state(
                &self.volume,
                format!(
                    "volume record names {:?} but the newest session is {last}",
                    self.record.last
                ),
            )),
        }
    }

    /// Whether the volume has an archive (a persisted volume record).
    pub fn is_archived(&self) -> bool {
        self.persisted
    }

    pub fn require_archived(&self) -> EngineResult<()> {
        if self.persisted {
            Ok(())
        } else {
            Err(EngineError::UnknownVolume(self.volume.to_string()))
        }
    }

    /// Persist the volume record locally, then on the destination.
    pub fn save_record(&mut self, destination: &dyn Destination) -> EngineResult<()> {
        self.meta.save_volume(&self.record)?;
        destination.write_atomic(
            &volume_record_path(&self.volume),
            &self.record.to_record().to_bytes(),
        )?;
        self.persisted = true;
        Ok(())
    }

    /// Read the destination's copy of the volume record, if any.
    pub fn remote_record(
        &self,
        destination: &dyn Destination,
    ) -> EngineResult<Option<VolumeRecord>> {
        let Some(data) = destination.read(&volume_record_path(&self.volume))? else {
            return Ok(None);
        };
        let record = KeyValueRecord::from_bytes(&data)?;
        Ok(Some(VolumeRecord::from_record(&record)?))
    }

    pub fn chunks(&self, volume_size: u64) -> u64 {
        chunk_count(volume_size, self.chunk_size)
    }

    pub fn pipeline(&self, compression_level: i32) -> ChunkPipeline {
        ChunkPipeline::new(
            Box::new(ZstdCodec::new(compression_level)),
            self.chunk_size as usize,
        )
    }
}

/// Finish or discard sends interrupted before their commit completed.
fn recover_sessions(
    meta: &MetaStore,
    volume: &VolumeName,
    destination: &dyn Destination,
) -> EngineResult<()> {
    let (_, pending) = meta.list_sessions()?;
    for name in pending {
        let temp_dir = meta.temp_dir(&name);
        if destination.exists(&session_path(volume, &name))? {
            info!(volume = %volume, session = %name, "completing interrupted commit");
            meta.rename_dir(&temp_dir, &meta.session_dir(&name))?;
        } else {
            warn!(volume = %volume, session = %name, "discarding interrupted session");
            meta.remove_session_dir(&temp_dir)?;
        }
    }
    for entry in destination.list(volume.as_str())? {
        if SessionName::from_temp_name(&entry).is_some() {
            warn!(volume = %volume, path = %entry, "removing partial session from destination");
            destination.remove(&format!("{volume}/{entry}"))?;
        }
    }
    Ok(())
}
