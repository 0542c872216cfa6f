use std::fs::File;
use std::io::{self, Cursor, Seek, SeekFrom, Write};

use tracing::{debug, info};
use vbak_codec::{is_zero, ChunkPipeline, ZstdCodec};
use vbak_manifest::{merge_manifests, Manifest, ManifestResult, MergedEntry};
use vbak_store::StoreError;
use vbak_types::{chunk_count, ChunkAddr, SessionName, StorageLayout};

use crate::context::{chunk_path, session_path, EngineContext};
use crate::engine::Services;
use crate::error::{EngineError, EngineResult};
use crate::provider::{read_full, Generation, VolumeReader};
use crate::report::ReceiveReport;

/// Where an extracted volume is written.
pub trait ExtractTarget: Write + Seek {
    /// Set the final length of the extracted volume.
    fn set_size(&mut self, size: u64) -> io::Result<()>;
}

impl ExtractTarget for File {
    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }
}

impl ExtractTarget for Cursor<Vec<u8>> {
    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.get_mut().resize(size as usize, 0);
        Ok(())
    }
}

/// What to do with each verified chunk of a session.
pub enum ReceiveMode<'a> {
    /// Write the volume image.
    Extract(&'a mut dyn ExtractTarget),
    /// Compare against the current volume; with `remap`, mark every
    /// differing chunk in the dirty map so the next send repairs it.
    Diff { remap: bool },
    /// Fetch and check every chunk, writing nothing.
    Verify,
}

impl ReceiveMode<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Extract(_) => "extract",
            Self::Diff { .. } => "diff",
            Self::Verify => "verify",
        }
    }
}

/// Newest-wins view of a session and all its ancestors, checked to cover
/// every chunk of the session's volume size.
fn merged_view(
    ctx: &EngineContext,
    session: &SessionName,
    volume_size: u64,
    chunk_size: u64,
) -> EngineResult<Vec<MergedEntry<SessionName>>> {
    let Some(last) = ChunkAddr::last_of(volume_size, chunk_size) else {
        return Ok(Vec::new());
    };
    let ancestry = ctx.chain.ancestry(session)?;
    if let Some(record) = ancestry.iter().find(|r| r.layout != StorageLayout::Folders) {
        return Err(EngineError::state(
            &ctx.volume,
            format!(
                "session {} uses the {} layout, which cannot be read chunk by chunk",
                record.name,
                record.layout.as_str()
            ),
        ));
    }
    let manifests = ancestry
        .into_iter()
        .map(|record| Ok((record.name, ctx.meta.load_manifest(&record.name)?)))
        .collect::<EngineResult<Vec<(SessionName, Manifest)>>>()?;
    let sources = manifests
        .iter()
        .map(|(name, manifest)| (*name, manifest.iter().copied().map(Ok)))
        .collect();
    let merged = merge_manifests(sources, Some(last)).collect::<ManifestResult<Vec<_>>>()?;

    for (i, entry) in merged.iter().enumerate() {
        let expected = ChunkAddr::from_index(i as u64, chunk_size);
        if entry.addr != expected {
            return Err(EngineError::MissingEntry(expected));
        }
    }
    let chunks = chunk_count(volume_size, chunk_size);
    if (merged.len() as u64) < chunks {
        return Err(EngineError::MissingEntry(ChunkAddr::from_index(
            merged.len() as u64,
            chunk_size,
        )));
    }
    Ok(merged)
}

fn integrity(addr: ChunkAddr, reason: impl ToString) -> EngineError {
    EngineError::Integrity {
        addr,
        reason: reason.to_string(),
    }
}

/// Read one reference chunk; `None` when the reference ends before it.
fn reference_chunk(
    reader: &mut dyn VolumeReader,
    addr: ChunkAddr,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    reader.seek(SeekFrom::Start(addr.offset()))?;
    let read = read_full(reader, buf)?;
    Ok((read > 0).then_some(read))
}

/// Reconstruct a session from the destination and extract, verify, or
/// compare it. Nothing unverified is written: every stored chunk is
/// length-bounded, hash-checked, and decompressed before it is used.
pub(crate) fn receive_volume(
    services: &Services<'_>,
    ctx: &mut EngineContext,
    session: Option<SessionName>,
    mut mode: ReceiveMode<'_>,
) -> EngineResult<ReceiveReport> {
    ctx.require_archived()?;
    let volume = ctx.volume.clone();
    let record = match session {
        Some(name) => ctx.chain.require(&name)?.clone(),
        None => ctx
            .chain
            .last()
            .cloned()
            .ok_or_else(|| EngineError::state(&volume, "volume has no sessions"))?,
    };
    let chunk_size = record.chunk_size;
    let size = record.volume_size;
    let pipeline = ChunkPipeline::new(
        Box::new(ZstdCodec::new(services.compression_level)),
        chunk_size as usize,
    );
    let merged = merged_view(ctx, &record.name, size, chunk_size)?;
    let mut report = ReceiveReport::new(record.name, size);
    info!(volume = %volume, session = %record.name, mode = mode.name(), "receiving session");

    let paths: Vec<String> = merged
        .iter()
        .filter(|e| !e.is_zero())
        .map(|e| chunk_path(&session_path(&volume, &e.source), e.addr))
        .collect();
    let expected_fetches = paths.len();
    let mut fetched = services
        .destination
        .fetch(paths, pipeline.stored_len_bound() as u64)?;

    let mut reference = match mode {
        ReceiveMode::Diff { .. } => {
            let reference_size = services.snapshots.current_size(&volume)?;
            if reference_size != size {
                report.reference_size = Some(reference_size);
            }
            Some(services.snapshots.open_readable(&volume, Generation::Current)?)
        }
        _ => None,
    };
    let mut reference_buf = vec![0u8; chunk_size as usize];
    let mut fetch_count = 0;

    for entry in &merged {
        let addr = entry.addr;
        let span = addr.span(chunk_size, size) as usize;
        report.chunks += 1;

        let raw = match entry.hash {
            None => {
                report.zero_chunks += 1;
                None
            }
            Some(hash) => {
                let expected_path = chunk_path(&session_path(&volume, &entry.source), addr);
                let (path, stored) = match fetched.next() {
                    Some(Ok(item)) => item,
                    Some(Err(StoreError::NotFound(path))) => {
                        return Err(integrity(addr, format!("stored chunk {path} is missing")))
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(StoreError::Truncated(expected_fetches - fetch_count).into())
                    }
                };
                fetch_count += 1;
                if path != expected_path {
                    let reason = format!("received {path}, expected {expected_path}");
                    return Err(integrity(addr, reason));
                }
                report.bytes_fetched += stored.len() as u64;
                let raw = pipeline
                    .decode(&stored, &hash, span)
                    .map_err(|e| integrity(addr, e))?;
                Some(raw)
            }
        };

        match &mut mode {
            ReceiveMode::Extract(target) => {
                if let Some(raw) = &raw {
                    target.seek(SeekFrom::Start(addr.offset()))?;
                    target.write_all(raw)?;
                    report.bytes_written += raw.len() as u64;
                }
            }
            ReceiveMode::Diff { .. } => {
                let Some(reader) = reference.as_deref_mut() else {
                    continue;
                };
                let same = match reference_chunk(reader, addr, &mut reference_buf[..span])? {
                    Some(read) if read == span => match &raw {
                        Some(raw) => raw[..] == reference_buf[..span],
                        None => is_zero(&reference_buf[..span]),
                    },
                    _ => false,
                };
                if !same {
                    debug!(chunk = %addr, "chunk differs from the volume");
                    report.differing.push(addr);
                }
            }
            ReceiveMode::Verify => {}
        }
    }

    match mode {
        ReceiveMode::Extract(target) => {
            target.set_size(size)?;
            target.flush()?;
        }
        ReceiveMode::Diff { remap: true } if !report.differing.is_empty() => {
            remap_differing(services, ctx, &report.differing)?;
        }
        _ => {}
    }
    info!(
        volume = %volume,
        session = %record.name,
        chunks = report.chunks,
        fetched = report.bytes_fetched,
        differing = report.differing.len(),
        "session received"
    );
    Ok(report)
}

/// Mark chunks in the dirty map so the next send resends them.
fn remap_differing(
    services: &Services<'_>,
    ctx: &EngineContext,
    differing: &[ChunkAddr],
) -> EngineResult<()> {
    if !ctx.maps.exists() {
        return Err(EngineError::state(&ctx.volume, "dirty map is missing"));
    }
    let chunks = ctx.chunks(services.snapshots.current_size(&ctx.volume)?);
    let mut map = ctx.maps.begin_update(chunks)?;
    let mut marked = 0;
    for addr in differing {
        let index = addr.index(ctx.chunk_size);
        if index < chunks {
            map.set(index)?;
            marked += 1;
        }
    }
    map.flush()?;
    drop(map);
    ctx.maps.finalize()?;
    info!(volume = %ctx.volume, marked, "differing chunks marked for resend");
    Ok(())
}
