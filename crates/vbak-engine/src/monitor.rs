use tracing::info;
use vbak_digest::DigestOutcome;

use crate::context::EngineContext;
use crate::engine::Services;
use crate::error::{EngineError, EngineResult};
use crate::report::MonitorReport;

/// Diff the volume's two snapshot generations and OR the result into its
/// dirty map. The map is left in its in-flight location.
pub(crate) fn digest_changes(
    services: &Services<'_>,
    ctx: &EngineContext,
    chunks: u64,
) -> EngineResult<DigestOutcome> {
    if !ctx.maps.exists() {
        return Err(EngineError::state(
            &ctx.volume,
            "sessions exist but the dirty map is missing",
        ));
    }
    if !services.snapshots.has_previous(&ctx.volume)? {
        return Err(EngineError::state(
            &ctx.volume,
            "dirty map present without a previous snapshot to diff against",
        ));
    }
    let report = services.diff.diff(&ctx.volume)?;
    Ok(ctx.maps.digest(&report, ctx.chunk_size, chunks)?)
}

/// Record changes without sending: digest, finalize the map, and rotate
/// the snapshot generations.
pub(crate) fn monitor_volume(
    services: &Services<'_>,
    ctx: &mut EngineContext,
) -> EngineResult<MonitorReport> {
    if ctx.chain.is_empty() {
        info!(volume = %ctx.volume, "no sessions yet, full transfer pending");
        return Ok(MonitorReport {
            volume: ctx.volume.clone(),
            full_transfer_pending: true,
            changed_bytes: 0,
            freed_bytes: 0,
            chunks_marked: 0,
        });
    }
    let size = services.snapshots.current_size(&ctx.volume)?;
    let outcome = digest_changes(services, ctx, ctx.chunks(size))?;
    ctx.maps.finalize()?;
    services.snapshots.rotate(&ctx.volume)?;
    info!(
        volume = %ctx.volume,
        changed = outcome.changed_bytes,
        freed = outcome.freed_bytes,
        chunks = outcome.chunks_marked,
        "volume monitored"
    );
    Ok(MonitorReport {
        volume: ctx.volume.clone(),
        full_transfer_pending: false,
        changed_bytes: outcome.changed_bytes,
        freed_bytes: outcome.freed_bytes,
        chunks_marked: outcome.chunks_marked,
    })
}
