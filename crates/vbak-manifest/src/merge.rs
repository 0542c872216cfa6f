use std::cmp::Reverse;
use std::collections::BinaryHeap;

use vbak_types::{ChunkAddr, ContentHash};

use crate::entry::ManifestEntry;
use crate::error::ManifestResult;

/// A merged manifest entry and the source it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry<S> {
    pub addr: ChunkAddr,
    pub hash: Option<ContentHash>,
    pub source: S,
}

impl<S> MergedEntry<S> {
    pub fn is_zero(&self) -> bool {
        self.hash.is_none()
    }
}

/// Streaming k-way merge of ascending manifests.
///
/// See [`merge_manifests`].
pub struct ManifestMerge<S, I> {
    sources: Vec<(S, I)>,
    heap: BinaryHeap<Reverse<(ChunkAddr, usize, Option<ContentHash>)>>,
    last: Option<ChunkAddr>,
    primed: bool,
    done: bool,
}

/// Merge manifests ordered newest-first.
///
/// For every address the entry of the lowest-ranked (most recent) source
/// that has one wins. Entries above `last` are dropped; `None` disables
/// truncation.
pub fn merge_manifests<S, I>(sources: Vec<(S, I)>, last: Option<ChunkAddr>) -> ManifestMerge<S, I>
where
    S: Clone,
    I: Iterator<Item = ManifestResult<ManifestEntry>>,
{
    ManifestMerge {
        heap: BinaryHeap::with_capacity(sources.len()),
        sources,
        last,
        primed: false,
        done: false,
    }
}

impl<S, I> ManifestMerge<S, I>
where
    S: Clone,
    I: Iterator<Item = ManifestResult<ManifestEntry>>,
{
    fn advance(&mut self, rank: usize) -> ManifestResult<()> {
        if let Some(entry) = self.sources[rank].1.next() {
            let entry = entry?;
            self.heap.push(Reverse((entry.addr, rank, entry.hash)));
        }
        Ok(())
    }

    fn step(&mut self) -> ManifestResult<Option<MergedEntry<S>>> {
        if !self.primed {
            for rank in 0..self.sources.len() {
                self.advance(rank)?;
            }
            self.primed = true;
        }

        let Some(Reverse((addr, rank, hash))) = self.heap.pop() else {
            return Ok(None);
        };
        if self.last.is_some_and(|last| addr > last) {
            return Ok(None);
        }
        self.advance(rank)?;

        // Older sources holding the same address are superseded.
        while let Some(Reverse((next_addr, next_rank, _))) = self.heap.peek() {
            if *next_addr != addr {
                break;
            }
            let next_rank = *next_rank;
            self.heap.pop();
            self.advance(next_rank)?;
        }

        Ok(Some(MergedEntry {
            addr,
            hash,
            source: self.sources[rank].0.clone(),
        }))
    }
}

impl<S, I> Iterator for ManifestMerge<S, I>
where
    S: Clone,
    I: Iterator<Item = ManifestResult<ManifestEntry>>,
{
    type Item = ManifestResult<MergedEntry<S>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.step().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Manifest;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const CS: u64 = 0x10000;

    fn addr(i: u64) -> ChunkAddr {
        ChunkAddr::from_index(i, CS)
    }

    fn h(tag: &str) -> ContentHash {
        ContentHash::of(tag.as_bytes())
    }

    fn source(entries: &[(u64, Option<&str>)]) -> Vec<ManifestResult<ManifestEntry>> {
        entries
            .iter()
            .map(|(i, tag)| {
                Ok(ManifestEntry {
                    addr: addr(*i),
                    hash: tag.map(h),
                })
            })
            .collect()
    }

    fn run(
        sources: Vec<(&'static str, Vec<ManifestResult<ManifestEntry>>)>,
        last: Option<ChunkAddr>,
    ) -> Vec<MergedEntry<&'static str>> {
        let sources = sources
            .into_iter()
            .map(|(name, entries)| (name, entries.into_iter()))
            .collect();
        merge_manifests(sources, last)
            .collect::<ManifestResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn newest_source_wins() {
        let merged = run(
            vec![
                ("S2", source(&[(1, Some("B")), (2, Some("D"))])),
                ("S1", source(&[(0, Some("A")), (1, Some("B")), (2, Some("C"))])),
            ],
            None,
        );
        let view: Vec<(u64, ContentHash, &str)> = merged
            .iter()
            .map(|e| (e.addr.index(CS), e.hash.unwrap(), e.source))
            .collect();
        assert_eq!(
            view,
            vec![(0, h("A"), "S1"), (1, h("B"), "S2"), (2, h("D"), "S2")]
        );
    }

    #[test]
    fn zero_marker_supersedes_older_data() {
        let merged = run(
            vec![
                ("new", source(&[(0, None)])),
                ("old", source(&[(0, Some("A"))])),
            ],
            None,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_zero());
        assert_eq!(merged[0].source, "new");
    }

    #[test]
    fn truncates_after_last_address() {
        let merged = run(
            vec![("S1", source(&[(0, Some("A")), (1, Some("B")), (2, Some("C"))]))],
            Some(addr(1)),
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].addr, addr(1));
    }

    #[test]
    fn error_stops_the_merge() {
        let bad = vec![
            Ok(ManifestEntry::zero(addr(0))),
            Err(crate::error::ManifestError::MissingKey("boom".into())),
        ];
        let sources = vec![("S1", bad.into_iter())];
        let results: Vec<_> = merge_manifests(sources, None).collect();
        assert!(results.last().unwrap().is_err());
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[test]
    fn merges_loaded_manifests() {
        let newer = Manifest::from_entries(vec![ManifestEntry::stored(addr(3), h("x"))]).unwrap();
        let older = Manifest::from_entries(vec![
            ManifestEntry::stored(addr(0), h("a")),
            ManifestEntry::stored(addr(3), h("b")),
        ])
        .unwrap();
        let sources = vec![
            (1u32, newer.iter().copied().map(Ok)),
            (0u32, older.iter().copied().map(Ok)),
        ];
        let merged: Vec<_> = merge_manifests(sources, None).map(|e| e.unwrap()).collect();
        assert_eq!(merged[1].hash, Some(h("x")));
        assert_eq!(merged[1].source, 1);
    }

    proptest! {
        #[test]
        fn matches_naive_overlay(
            layers in proptest::collection::vec(
                proptest::collection::btree_map(0u64..64, proptest::option::of(0u8..4), 0..32),
                1..5
            ),
            last in proptest::option::of(0u64..64),
        ) {
            // layers[0] is the oldest
            let mut expected: BTreeMap<u64, (Option<u8>, usize)> = BTreeMap::new();
            for (age, layer) in layers.iter().enumerate() {
                for (i, tag) in layer {
                    expected.insert(*i, (*tag, age));
                }
            }
            if let Some(last) = last {
                expected.retain(|i, _| *i <= last);
            }

            let sources: Vec<_> = layers
                .iter()
                .enumerate()
                .rev()
                .map(|(age, layer)| {
                    let entries: Vec<ManifestResult<ManifestEntry>> = layer
                        .iter()
                        .map(|(i, tag)| Ok(ManifestEntry {
                            addr: addr(*i),
                            hash: tag.map(|t| ContentHash::of(&[t])),
                        }))
                        .collect();
                    (age, entries.into_iter())
                })
                .collect();
            let merged: Vec<_> = merge_manifests(sources, last.map(addr))
                .collect::<ManifestResult<Vec<_>>>()
                .unwrap();

            prop_assert_eq!(merged.len(), expected.len());
            for (entry, (i, (tag, age))) in merged.iter().zip(expected.iter()) {
                prop_assert_eq!(entry.addr, addr(*i));
                prop_assert_eq!(entry.hash, tag.map(|t| ContentHash::of(&[t])));
                prop_assert_eq!(entry.source, *age);
            }
        }
    }
}
