use std::collections::HashMap;

use vbak_manifest::{merge_manifests, Manifest, ManifestEntry};
use vbak_types::{ChunkAddr, SessionName};

use crate::error::{ChainError, ChainResult};

/// How stored chunks move when a run of sessions is folded into the
/// session that follows it.
///
/// The oldest session of the run is the physical base: winning chunks of
/// every newer session are relocated into it, superseded chunks are
/// discarded, and the base is finally renamed to the target's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub base: SessionName,
    pub target: SessionName,
    /// Sessions other than the base whose directories are consumed.
    pub consumed: Vec<SessionName>,
    /// Newest-wins view of the run and target, truncated to the target size.
    pub merged: Manifest,
    /// Stored chunks to move from the named session into the base.
    pub relocate: Vec<(SessionName, ChunkAddr)>,
    /// Stored chunks that are no longer referenced.
    pub discard: Vec<(SessionName, ChunkAddr)>,
}

impl MergePlan {
    /// Plan a merge of `sessions` (oldest first, the merge target last).
    /// `last` is the last chunk address of the target's volume size, `None`
    /// for an empty volume.
    pub fn build(
        sessions: &[(SessionName, &Manifest)],
        last: Option<ChunkAddr>,
    ) -> ChainResult<Self> {
        let (Some((base, _)), Some((target, _))) = (sessions.first(), sessions.last()) else {
            return Err(ChainError::NothingToPrune);
        };
        if sessions.len() < 2 {
            return Err(ChainError::NothingToPrune);
        }

        let sources: Vec<_> = sessions
            .iter()
            .rev()
            .map(|(name, manifest)| (*name, manifest.iter().copied().map(Ok)))
            .collect();
        let mut entries = Vec::new();
        let mut owner: HashMap<ChunkAddr, SessionName> = HashMap::new();
        if last.is_some() {
            for merged in merge_manifests(sources, last) {
                let merged = merged?;
                owner.insert(merged.addr, merged.source);
                entries.push(ManifestEntry {
                    addr: merged.addr,
                    hash: merged.hash,
                });
            }
        }

        let mut relocate = Vec::new();
        let mut discard = Vec::new();
        for (name, manifest) in sessions {
            for entry in manifest.iter().filter(|e| !e.is_zero()) {
                match owner.get(&entry.addr) {
                    Some(winner) if winner == name => {
                        if name != base {
                            relocate.push((*name, entry.addr));
                        }
                    }
                    _ => discard.push((*name, entry.addr)),
                }
            }
        }

        Ok(Self {
            base: *base,
            target: *target,
            consumed: sessions[1..].iter().map(|(name, _)| *name).collect(),
            merged: Manifest::from_entries(entries)?,
            relocate,
            discard,
        })
    }

    /// Whether the merged manifest references a stored chunk in `session`
    /// at `addr` after the merge.
    pub fn survives(&self, session: &SessionName, addr: ChunkAddr) -> bool {
        self.relocate.contains(&(*session, addr))
            || (*session == self.base && !self.discard.contains(&(*session, addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbak_types::ContentHash;

    const CS: u64 = 65536;

    fn name(day: u32) -> SessionName {
        format!("S_202402{day:02}-000000").parse().unwrap()
    }

    fn addr(i: u64) -> ChunkAddr {
        ChunkAddr::from_index(i, CS)
    }

    fn h(tag: &str) -> ContentHash {
        ContentHash::of(tag.as_bytes())
    }

    fn manifest(entries: &[(u64, Option<&str>)]) -> Manifest {
        Manifest::from_entries(
            entries
                .iter()
                .map(|(i, tag)| ManifestEntry {
                    addr: addr(*i),
                    hash: tag.map(h),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn two_session_merge() {
        let s1 = manifest(&[(0, Some("A")), (1, Some("B")), (2, Some("C"))]);
        let s2 = manifest(&[(1, Some("B")), (2, Some("D"))]);
        let plan = MergePlan::build(&[(name(1), &s1), (name(2), &s2)], Some(addr(2))).unwrap();

        assert_eq!(plan.base, name(1));
        assert_eq!(plan.target, name(2));
        assert_eq!(plan.consumed, vec![name(2)]);
        let view: Vec<(ChunkAddr, Option<ContentHash>)> =
            plan.merged.iter().map(|e| (e.addr, e.hash)).collect();
        assert_eq!(
            view,
            vec![(addr(0), Some(h("A"))), (addr(1), Some(h("B"))), (addr(2), Some(h("D")))]
        );
        assert_eq!(plan.relocate, vec![(name(2), addr(1)), (name(2), addr(2))]);
        assert_eq!(plan.discard, vec![(name(1), addr(1)), (name(1), addr(2))]);
        assert!(plan.survives(&name(1), addr(0)));
        assert!(!plan.survives(&name(1), addr(2)));
        assert!(plan.survives(&name(2), addr(2)));
    }

    #[test]
    fn zero_marker_discards_older_data() {
        let s1 = manifest(&[(0, Some("A")), (1, Some("B"))]);
        let s2 = manifest(&[(1, None)]);
        let plan = MergePlan::build(&[(name(1), &s1), (name(2), &s2)], Some(addr(1))).unwrap();
        assert!(plan.merged.lookup(addr(1)).unwrap().is_zero());
        assert!(plan.relocate.is_empty());
        assert_eq!(plan.discard, vec![(name(1), addr(1))]);
    }

    #[test]
    fn shrunken_target_truncates() {
        let s1 = manifest(&[(0, Some("A")), (1, Some("B")), (2, Some("C"))]);
        let s2 = manifest(&[(0, Some("E"))]);
        let s3 = manifest(&[(1, Some("F"))]);
        let plan = MergePlan::build(
            &[(name(1), &s1), (name(2), &s2), (name(3), &s3)],
            Some(addr(1)),
        )
        .unwrap();
        assert_eq!(plan.merged.len(), 2);
        assert_eq!(plan.consumed, vec![name(2), name(3)]);
        assert_eq!(plan.relocate, vec![(name(2), addr(0)), (name(3), addr(1))]);
        assert_eq!(
            plan.discard,
            vec![(name(1), addr(0)), (name(1), addr(1)), (name(1), addr(2))]
        );
    }

    #[test]
    fn single_session_cannot_merge() {
        let s1 = manifest(&[(0, Some("A"))]);
        assert!(matches!(
            MergePlan::build(&[(name(1), &s1)], Some(addr(0))),
            Err(ChainError::NothingToPrune)
        ));
    }
}
