use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info, warn};
use vbak_chain::store::{INFO_FILE, MANIFEST_FILE};
use vbak_chain::SessionRecord;
use vbak_codec::{ChunkPipeline, Encoded};
use vbak_dedup::{ChunkLocation, ContentIndex};
use vbak_digest::DirtyMap;
use vbak_manifest::{ManifestEntry, ManifestWriter};
use vbak_store::{ContainerWriter, Destination};
use vbak_types::{ChunkAddr, SessionName, VolumeName};

use crate::context::{chunk_path, session_path, temp_session_path, EngineContext};
use crate::engine::Services;
use crate::error::{EngineError, EngineResult};
use crate::monitor::digest_changes;
use crate::provider::{read_full, Generation};
use crate::report::SendReport;

/// Which chunks of the current volume a session has to carry.
struct Eligibility {
    /// `None` for the first session: everything is sent.
    map: Option<DirtyMap>,
    /// First chunk of a range past the previous volume end.
    grown_from: Option<u64>,
    /// Final chunk of a shrunken volume.
    shrunk_tail: Option<u64>,
}

impl Eligibility {
    fn includes(&self, index: u64) -> bool {
        match &self.map {
            None => true,
            Some(map) => {
                self.grown_from.is_some_and(|first| index >= first)
                    || self.shrunk_tail == Some(index)
                    || map.get(index)
            }
        }
    }
}

/// Send the chunks changed since the last session as a new session.
///
/// Commit order: the destination's temporary session directory is renamed
/// first, then the local one, then the volume record is updated; the dirty
/// map is cleared and the snapshot rotated only after that.
pub(crate) fn send_volume(
    services: &Services<'_>,
    ctx: &mut EngineContext,
    index: &mut Option<Box<dyn ContentIndex>>,
) -> EngineResult<SendReport> {
    let dest = services.destination;
    let volume = ctx.volume.clone();
    let size = services.snapshots.current_size(&volume)?;
    let chunk_size = ctx.chunk_size;
    let chunks = ctx.chunks(size);
    let previous = ctx.chain.last().cloned();
    let mut report = SendReport {
        volume_size: size,
        ..Default::default()
    };

    let eligibility = match &previous {
        None => {
            if !ctx.is_archived() && ctx.remote_record(dest)?.is_some() {
                return Err(EngineError::state(
                    &volume,
                    "destination holds an archive of this volume but local metadata is missing",
                ));
            }
            Eligibility {
                map: None,
                grown_from: None,
                shrunk_tail: None,
            }
        }
        Some(prev) => {
            let outcome = digest_changes(services, ctx, chunks)?;
            report.changed_bytes = outcome.changed_bytes;
            report.freed_bytes = outcome.freed_bytes;
            Eligibility {
                map: Some(ctx.maps.open_current(chunks)?),
                grown_from: (size > prev.volume_size)
                    .then(|| ChunkAddr::containing(prev.volume_size, chunk_size).index(chunk_size)),
                shrunk_tail: (size < prev.volume_size)
                    .then(|| ChunkAddr::last_of(size, chunk_size))
                    .flatten()
                    .map(|addr| addr.index(chunk_size)),
            }
        }
    };

    let size_changed = previous.as_ref().is_some_and(|p| p.volume_size != size);
    let has_work =
        previous.is_none() || size_changed || (0..chunks).any(|i| eligibility.includes(i));
    if !has_work {
        drop(eligibility);
        ctx.maps.finalize()?;
        services.snapshots.rotate(&volume)?;
        info!(volume = %volume, "no changes to send");
        return Ok(report);
    }

    let session = SessionName::next_after(previous.as_ref().map(|p| &p.name));
    let mut record = SessionRecord::new(session, size, chunk_size);
    if let Some(prev) = &previous {
        record.previous = Some(prev.name);
        record.sequence = prev.sequence + 1;
    }
    let temp_local = ctx.meta.temp_dir(&session);
    let temp_remote = temp_session_path(&volume, &session);
    fs::create_dir_all(&temp_local)?;

    let pipeline = ctx.pipeline(services.compression_level);
    let target = SessionTarget {
        volume: &volume,
        record: &record,
        local: &temp_local,
        remote: &temp_remote,
    };
    let committed = stream_session(
        services,
        &pipeline,
        &eligibility,
        &target,
        index,
        &mut report,
    )
    .and_then(|()| {
        drop(eligibility);
        commit_session(dest, ctx, record, &temp_local, &temp_remote)
    });
    if let Err(e) = committed {
        warn!(volume = %volume, session = %session, error = %e, "send failed before commit");
        if let Some(index) = index.as_deref_mut() {
            index.relocate(&volume, &session, &session, &|_| false)?;
        }
        return Err(e);
    }
    ctx.maps.reset(chunks)?;
    services.snapshots.rotate(&volume)?;

    report.session = Some(session);
    info!(
        volume = %volume,
        session = %session,
        stored = report.chunks_stored,
        linked = report.chunks_linked,
        zero = report.zero_chunks,
        bytes = report.bytes_sent,
        "session committed"
    );
    Ok(report)
}

/// Move a fully streamed session to its final name on the destination and
/// locally, then record it in the chain and the volume record.
fn commit_session(
    dest: &dyn Destination,
    ctx: &mut EngineContext,
    record: SessionRecord,
    temp_local: &Path,
    temp_remote: &str,
) -> EngineResult<()> {
    let session = record.name;
    dest.rename(temp_remote, &session_path(&ctx.volume, &session))?;
    ctx.meta
        .rename_dir(temp_local, &ctx.meta.session_dir(&session))?;
    ctx.chain.append(record)?;
    if ctx.record.first.is_none() {
        ctx.record.first = Some(session);
    }
    ctx.record.last = Some(session);
    ctx.save_record(dest)
}

/// The session being written and its temporary directories.
struct SessionTarget<'a> {
    volume: &'a VolumeName,
    record: &'a SessionRecord,
    local: &'a Path,
    remote: &'a str,
}

/// Encode every eligible chunk into one container stream targeting the
/// temporary session directory, followed by the manifest and info.
fn stream_session(
    services: &Services<'_>,
    pipeline: &ChunkPipeline,
    eligibility: &Eligibility,
    target: &SessionTarget<'_>,
    index: &mut Option<Box<dyn ContentIndex>>,
    report: &mut SendReport,
) -> EngineResult<()> {
    let SessionTarget {
        volume,
        record,
        local: temp_local,
        remote: temp_remote,
    } = *target;
    let chunk_size = record.chunk_size;
    let size = record.volume_size;
    let chunks = vbak_types::chunk_count(size, chunk_size);

    let mut reader = services
        .snapshots
        .open_readable(volume, Generation::Current)?;
    let mut container = ContainerWriter::new(services.destination.open_stream()?);
    let manifest_path = temp_local.join(MANIFEST_FILE);
    let mut manifest = ManifestWriter::new(BufWriter::new(File::create(&manifest_path)?));
    let mut buf = vec![0u8; chunk_size as usize];

    for i in (0..chunks).filter(|i| eligibility.includes(*i)) {
        let addr = ChunkAddr::from_index(i, chunk_size);
        let span = addr.span(chunk_size, size) as usize;
        reader.seek(SeekFrom::Start(addr.offset()))?;
        let read = read_full(&mut reader, &mut buf[..span])?;
        if read < span {
            return Err(EngineError::state(
                volume,
                format!(
                    "volume ended at {} while reading chunk {addr}",
                    addr.offset() + read as u64
                ),
            ));
        }
        report.chunks_eligible += 1;
        report.bytes_read += span as u64;

        let is_final = i + 1 == chunks;
        match pipeline.encode(&buf[..span], is_final)? {
            Encoded::Zero => {
                manifest.push(&ManifestEntry::zero(addr))?;
                report.zero_chunks += 1;
            }
            Encoded::Stored { hash, bytes } => {
                manifest.push(&ManifestEntry::stored(addr, hash))?;
                let path = chunk_path(temp_remote, addr);
                let known = match index.as_deref() {
                    Some(index) => index.lookup(&hash)?,
                    None => None,
                };
                match known {
                    Some(location) => {
                        let same_session =
                            location.volume == *volume && location.session == record.name;
                        let link = if same_session {
                            chunk_path(temp_remote, location.addr)
                        } else {
                            location.storage_path()
                        };
                        debug!(chunk = %addr, target = %link, "linking duplicate chunk");
                        container.append_link(&path, &link)?;
                        report.chunks_linked += 1;
                    }
                    None => {
                        container.append_file(&path, &bytes)?;
                        report.chunks_stored += 1;
                        report.bytes_sent += bytes.len() as u64;
                        if let Some(index) = index.as_deref_mut() {
                            let location = ChunkLocation::new(volume.clone(), record.name, addr);
                            index.insert(hash, location)?;
                        }
                    }
                }
            }
        }
    }

    let mut manifest_file = manifest.finish()?;
    manifest_file.flush()?;
    manifest_file.get_ref().sync_all()?;
    drop(manifest_file);

    let info = record.to_record().to_bytes();
    vbak_chain::write_atomic(&temp_local.join(INFO_FILE), &info)?;
    container.append_file(&format!("{temp_remote}/{MANIFEST_FILE}"), &fs::read(&manifest_path)?)?;
    container.append_file(&format!("{temp_remote}/{INFO_FILE}"), &info)?;
    debug!(
        files = container.files(),
        links = container.links(),
        bytes = container.bytes(),
        "closing session stream"
    );
    container.finish()?.finish()?;
    Ok(())
}
