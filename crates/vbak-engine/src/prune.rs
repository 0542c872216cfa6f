use tracing::{debug, info};
use vbak_chain::store::{INFO_FILE, MANIFEST_FILE};
use vbak_chain::{ChainError, ChainResult, MergePlan, PruneSelector, SessionRecord};
use vbak_dedup::ContentIndex;
use vbak_manifest::Manifest;
use vbak_store::FileOp;
use vbak_types::SessionName;

use crate::context::{chunk_path, session_path, EngineContext};
use crate::engine::Services;
use crate::error::EngineResult;
use crate::report::PruneReport;

/// Remove a run of sessions by folding their data into the session that
/// follows the run.
///
/// The volume record carries a resync flag for the duration of the merge;
/// finding it set later means local and destination metadata may disagree.
pub(crate) fn prune_volume(
    services: &Services<'_>,
    ctx: &mut EngineContext,
    selector: &PruneSelector,
    index: &mut Option<Box<dyn ContentIndex>>,
) -> EngineResult<PruneReport> {
    ctx.require_archived()?;
    let dest = services.destination;
    let volume = ctx.volume.clone();
    let run = ctx.chain.select_prune(selector)?;

    let mut names = run.sessions.clone();
    names.push(run.target);
    let records = names
        .iter()
        .map(|name| ctx.chain.require(name).cloned())
        .collect::<ChainResult<Vec<SessionRecord>>>()?;
    for record in &records {
        if !record.layout.is_mergeable() {
            return Err(ChainError::NotMergeable(record.name).into());
        }
        if record.chunk_size != ctx.chunk_size {
            return Err(ChainError::ChunkSizeMismatch {
                session: record.name,
                expected: ctx.chunk_size,
                found: record.chunk_size,
            }
            .into());
        }
    }
    let manifests = names
        .iter()
        .map(|name| ctx.meta.load_manifest(name))
        .collect::<ChainResult<Vec<Manifest>>>()?;
    let sessions: Vec<(SessionName, &Manifest)> =
        names.iter().copied().zip(manifests.iter()).collect();

    let (Some(base_record), Some(target_record)) = (records.first(), records.last()) else {
        return Err(ChainError::NothingToPrune.into());
    };
    let plan = MergePlan::build(&sessions, target_record.last_addr())?;
    let mut merged_record = target_record.clone();
    merged_record.previous = base_record.previous;
    info!(
        volume = %volume,
        sessions = run.sessions.len(),
        target = %plan.target,
        relocate = plan.relocate.len(),
        discard = plan.discard.len(),
        "merging sessions"
    );

    ctx.record.meta_resync = true;
    ctx.save_record(dest)?;

    let base_remote = session_path(&volume, &plan.base);
    let mut moves: Vec<FileOp> = plan
        .discard
        .iter()
        .map(|(session, addr)| FileOp::Remove(chunk_path(&session_path(&volume, session), *addr)))
        .collect();
    moves.extend(plan.relocate.iter().map(|(session, addr)| FileOp::Rename {
        from: chunk_path(&session_path(&volume, session), *addr),
        to: chunk_path(&base_remote, *addr),
    }));
    dest.apply(&moves)?;

    let base_local = ctx.meta.session_dir(&plan.base);
    let info = merged_record.to_record().to_bytes();
    ctx.meta.save_manifest_at(&base_local, &plan.merged)?;
    ctx.meta.save_session_at(&base_local, &merged_record)?;
    dest.write_atomic(&format!("{base_remote}/{MANIFEST_FILE}"), &plan.merged.to_bytes()?)?;
    dest.write_atomic(&format!("{base_remote}/{INFO_FILE}"), &info)?;

    let mut renames: Vec<FileOp> = plan
        .consumed
        .iter()
        .map(|session| FileOp::Remove(session_path(&volume, session)))
        .collect();
    renames.push(FileOp::Rename {
        from: base_remote,
        to: session_path(&volume, &plan.target),
    });
    dest.apply(&renames)?;
    for session in &plan.consumed {
        ctx.meta.remove_session_dir(&ctx.meta.session_dir(session))?;
    }
    ctx.meta
        .rename_dir(&base_local, &ctx.meta.session_dir(&plan.target))?;

    for session in &run.sessions {
        ctx.chain.delete(session)?;
    }
    ctx.chain.update(merged_record)?;
    ctx.record.first = ctx.chain.first().map(|r| r.name);

    if let Some(index) = index.as_deref_mut() {
        for session in &names {
            let dropped = index.relocate(&volume, session, &plan.target, &|addr| {
                plan.survives(session, addr)
            })?;
            if dropped > 0 {
                debug!(volume = %volume, session = %session, dropped, "index entries dropped");
            }
        }
    }

    ctx.record.meta_resync = false;
    ctx.save_record(dest)?;
    info!(volume = %volume, target = %plan.target, "sessions merged");
    Ok(PruneReport {
        removed: run.sessions,
        target: plan.target,
        chunks_relocated: plan.relocate.len(),
        chunks_discarded: plan.discard.len(),
    })
}
