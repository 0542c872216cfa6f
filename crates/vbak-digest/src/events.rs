use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dirty_map::DirtyMap;
use crate::error::{DigestError, DigestResult};

/// Kind of a block-level diff event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Changed,
    Freed,
    Unchanged,
}

/// A byte range reported by the diff producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEvent {
    pub kind: DiffKind,
    pub offset: u64,
    pub length: u64,
}

impl DiffEvent {
    pub fn changed(offset: u64, length: u64) -> Self {
        Self {
            kind: DiffKind::Changed,
            offset,
            length,
        }
    }

    pub fn freed(offset: u64, length: u64) -> Self {
        Self {
            kind: DiffKind::Freed,
            offset,
            length,
        }
    }
}

/// All diff events between two generations of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Block size the producer works in; every offset and length is a multiple.
    pub granularity: u64,
    #[serde(default)]
    pub events: Vec<DiffEvent>,
}

impl DiffReport {
    pub fn new(granularity: u64, events: Vec<DiffEvent>) -> Self {
        Self {
            granularity,
            events,
        }
    }

    /// Decode a JSON report.
    pub fn from_json(data: &[u8]) -> DigestResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Check the report against the volume's chunk size.
    pub fn validate(&self, chunk_size: u64) -> DigestResult<()> {
        if self.granularity == 0 {
            return Err(DigestError::Malformed("granularity is zero".into()));
        }
        if chunk_size % self.granularity != 0 {
            return Err(DigestError::Granularity {
                granularity: self.granularity,
                chunk_size,
            });
        }
        for event in &self.events {
            if event.offset % self.granularity != 0 || event.length % self.granularity != 0 {
                return Err(DigestError::Malformed(format!(
                    "event at {} (+{}) not aligned to {}",
                    event.offset, event.length, self.granularity
                )));
            }
            if event.offset.checked_add(event.length).is_none() {
                return Err(DigestError::Malformed(format!(
                    "event at {} (+{}) overflows",
                    event.offset, event.length
                )));
            }
        }
        Ok(())
    }
}

/// Byte and chunk counters from applying a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestOutcome {
    pub changed_bytes: u64,
    pub freed_bytes: u64,
    pub chunks_marked: u64,
}

impl DigestOutcome {
    /// Whether the report contained any change.
    pub fn has_changes(&self) -> bool {
        self.changed_bytes > 0 || self.freed_bytes > 0
    }
}

/// OR every chunk touched by a changed or freed event into `map`.
///
/// Events reaching past the end of the map (space freed by a shrink) are
/// clamped to the map.
pub fn apply_report(
    map: &mut DirtyMap,
    report: &DiffReport,
    chunk_size: u64,
) -> DigestResult<DigestOutcome> {
    report.validate(chunk_size)?;
    let mut outcome = DigestOutcome::default();
    let before = map.count();

    for event in &report.events {
        if event.length == 0 || event.kind == DiffKind::Unchanged {
            continue;
        }
        match event.kind {
            DiffKind::Changed => outcome.changed_bytes += event.length,
            DiffKind::Freed => outcome.freed_bytes += event.length,
            DiffKind::Unchanged => {}
        }
        let first = event.offset / chunk_size;
        let last = (event.offset + event.length - 1) / chunk_size;
        if first >= map.chunks() {
            warn!(
                offset = event.offset,
                length = event.length,
                "diff event past end of volume ignored"
            );
            continue;
        }
        map.set_range(first, last.min(map.chunks() - 1))?;
    }

    outcome.chunks_marked = map.count() - before;
    debug!(
        changed = outcome.changed_bytes,
        freed = outcome.freed_bytes,
        marked = outcome.chunks_marked,
        "applied diff report"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CS: u64 = 64 * 1024;
    const G: u64 = 4096;

    #[test]
    fn json_decoding() {
        let json = br#"{"granularity": 4096, "events": [
            {"kind": "changed", "offset": 0, "length": 8192},
            {"kind": "freed", "offset": 65536, "length": 4096},
            {"kind": "unchanged", "offset": 131072, "length": 4096}
        ]}"#;
        let report = DiffReport::from_json(json).unwrap();
        assert_eq!(report.granularity, G);
        assert_eq!(report.events.len(), 3);
        assert_eq!(report.events[1], DiffEvent::freed(65536, 4096));
    }

    #[test]
    fn json_garbage_rejected() {
        assert!(matches!(
            DiffReport::from_json(b"<xml/>"),
            Err(DigestError::Json(_))
        ));
    }

    #[test]
    fn granularity_must_divide_chunk_size() {
        let report = DiffReport::new(3000, vec![]);
        assert!(matches!(
            report.validate(CS),
            Err(DigestError::Granularity { .. })
        ));
        assert!(DiffReport::new(0, vec![]).validate(CS).is_err());
    }

    #[test]
    fn unaligned_event_rejected() {
        let report = DiffReport::new(G, vec![DiffEvent::changed(100, G)]);
        assert!(matches!(report.validate(CS), Err(DigestError::Malformed(_))));
    }

    #[test]
    fn event_spanning_chunks_marks_all() {
        let mut map = DirtyMap::anonymous(10).unwrap();
        let report = DiffReport::new(G, vec![DiffEvent::changed(CS - G, 2 * G)]);
        let outcome = apply_report(&mut map, &report, CS).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(outcome.chunks_marked, 2);
        assert_eq!(outcome.changed_bytes, 2 * G);
    }

    #[test]
    fn freed_marks_and_unchanged_does_not() {
        let mut map = DirtyMap::anonymous(10).unwrap();
        let report = DiffReport::new(
            G,
            vec![
                DiffEvent::freed(3 * CS, G),
                DiffEvent {
                    kind: DiffKind::Unchanged,
                    offset: 5 * CS,
                    length: CS,
                },
            ],
        );
        let outcome = apply_report(&mut map, &report, CS).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![3]);
        assert_eq!(outcome.freed_bytes, G);
        assert_eq!(outcome.changed_bytes, 0);
    }

    #[test]
    fn empty_report_is_noop() {
        let mut map = DirtyMap::anonymous(10).unwrap();
        map.set(4).unwrap();
        let outcome = apply_report(&mut map, &DiffReport::new(G, vec![]), CS).unwrap();
        assert!(!outcome.has_changes());
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn events_past_end_are_clamped() {
        let mut map = DirtyMap::anonymous(4).unwrap();
        let report = DiffReport::new(
            G,
            vec![DiffEvent::freed(3 * CS, 4 * CS), DiffEvent::freed(9 * CS, G)],
        );
        apply_report(&mut map, &report, CS).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![3]);
    }

    proptest! {
        #[test]
        fn every_changed_byte_has_its_chunk_marked(
            events in proptest::collection::vec((0u64..256, 1u64..64, any::<bool>()), 0..20)
        ) {
            let chunks = 20u64;
            let mut map = DirtyMap::anonymous(chunks).unwrap();
            let events: Vec<DiffEvent> = events
                .into_iter()
                .map(|(block, blocks, freed)| {
                    let (offset, length) = (block * G, blocks * G);
                    if freed {
                        DiffEvent::freed(offset, length)
                    } else {
                        DiffEvent::changed(offset, length)
                    }
                })
                .collect();
            let report = DiffReport::new(G, events.clone());
            apply_report(&mut map, &report, CS).unwrap();

            let mut expected = vec![false; chunks as usize];
            for e in &events {
                for byte_block in (e.offset / G)..((e.offset + e.length) / G) {
                    let chunk = byte_block * G / CS;
                    if chunk < chunks {
                        expected[chunk as usize] = true;
                    }
                }
            }
            for (i, dirty) in expected.iter().enumerate() {
                prop_assert_eq!(map.get(i as u64), *dirty, "chunk {}", i);
            }
        }
    }
}
