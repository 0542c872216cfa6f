use std::collections::{HashMap, HashSet};

use tracing::debug;
use vbak_types::SessionName;

use crate::error::{ChainError, ChainResult};
use crate::record::SessionRecord;

/// Which sessions a prune should remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneSelector {
    /// Exactly one named session.
    Single(SessionName),
    /// Every session whose name lies in `from..=to`.
    Range { from: SessionName, to: SessionName },
    /// Every session older than the given name.
    Before(SessionName),
}

/// A contiguous run of sessions selected for pruning and the session their
/// data is merged into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRun {
    /// Oldest first.
    pub sessions: Vec<SessionName>,
    /// Successor of the newest pruned session.
    pub target: SessionName,
}

/// Ordered index over a volume's sessions, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SessionChain {
    order: Vec<SessionName>,
    position: HashMap<SessionName, usize>,
    records: HashMap<SessionName, SessionRecord>,
}

impl SessionChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from unordered records, validating the linkage.
    pub fn from_records(records: Vec<SessionRecord>) -> ChainResult<Self> {
        let mut by_name = HashMap::with_capacity(records.len());
        for record in records {
            let name = record.name;
            if by_name.insert(name, record).is_some() {
                return Err(ChainError::Duplicate(name));
            }
        }
        if by_name.is_empty() {
            return Ok(Self::new());
        }

        let mut roots: Vec<SessionName> = Vec::new();
        let mut successor: HashMap<SessionName, SessionName> = HashMap::new();
        for record in by_name.values() {
            match record.previous {
                None => roots.push(record.name),
                Some(previous) => {
                    if !by_name.contains_key(&previous) {
                        return Err(ChainError::Dangling {
                            session: record.name,
                            previous,
                        });
                    }
                    if successor.insert(previous, record.name).is_some() {
                        return Err(ChainError::Fork(previous));
                    }
                }
            }
        }
        let root = match roots.as_slice() {
            [] => return Err(ChainError::NoRoot),
            [root] => *root,
            _ => {
                roots.sort();
                return Err(ChainError::MultipleRoots(roots));
            }
        };

        let mut order = vec![root];
        let mut current = root;
        while let Some(next) = successor.get(&current) {
            if *next <= current {
                return Err(ChainError::OutOfOrder {
                    previous: current,
                    name: *next,
                });
            }
            order.push(*next);
            current = *next;
        }
        if order.len() != by_name.len() {
            let reached: HashSet<&SessionName> = order.iter().collect();
            let mut unreachable: Vec<SessionName> = by_name
                .keys()
                .filter(|name| !reached.contains(name))
                .copied()
                .collect();
            unreachable.sort();
            return Err(ChainError::Unreachable(unreachable));
        }

        let mut chain = Self {
            order,
            position: HashMap::new(),
            records: by_name,
        };
        chain.reindex();
        Ok(chain)
    }

    fn reindex(&mut self) {
        self.position = self
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Option<&SessionRecord> {
        self.order.first().map(|name| &self.records[name])
    }

    pub fn last(&self) -> Option<&SessionRecord> {
        self.order.last().map(|name| &self.records[name])
    }

    pub fn get(&self, name: &SessionName) -> Option<&SessionRecord> {
        self.records.get(name)
    }

    pub fn require(&self, name: &SessionName) -> ChainResult<&SessionRecord> {
        self.get(name).ok_or(ChainError::NotFound(*name))
    }

    pub fn contains(&self, name: &SessionName) -> bool {
        self.records.contains_key(name)
    }

    /// Session names, oldest first.
    pub fn names(&self) -> &[SessionName] {
        &self.order
    }

    /// Records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.order.iter().map(|name| &self.records[name])
    }

    pub fn successor(&self, name: &SessionName) -> Option<&SessionRecord> {
        let pos = *self.position.get(name)?;
        self.order.get(pos + 1).map(|next| &self.records[next])
    }

    /// The named session followed by all of its predecessors, newest first.
    pub fn ancestry(&self, name: &SessionName) -> ChainResult<Vec<&SessionRecord>> {
        let pos = *self.position.get(name).ok_or(ChainError::NotFound(*name))?;
        Ok(self.order[..=pos]
            .iter()
            .rev()
            .map(|name| &self.records[name])
            .collect())
    }

    /// Append a new newest session, linking it to the current last one.
    pub fn append(&mut self, mut record: SessionRecord) -> ChainResult<&SessionRecord> {
        if self.records.contains_key(&record.name) {
            return Err(ChainError::Duplicate(record.name));
        }
        match self.last() {
            Some(last) => {
                if record.name <= last.name {
                    return Err(ChainError::OutOfOrder {
                        previous: last.name,
                        name: record.name,
                    });
                }
                record.previous = Some(last.name);
                record.sequence = last.sequence + 1;
            }
            None => {
                record.previous = None;
                record.sequence = 0;
            }
        }
        let name = record.name;
        debug!(session = %name, sequence = record.sequence, "session appended");
        self.position.insert(name, self.order.len());
        self.order.push(name);
        self.records.insert(name, record);
        Ok(&self.records[&name])
    }

    /// Remove a session, splicing its successor onto its predecessor.
    pub fn delete(&mut self, name: &SessionName) -> ChainResult<SessionRecord> {
        let pos = *self.position.get(name).ok_or(ChainError::NotFound(*name))?;
        if pos + 1 == self.order.len() {
            return Err(ChainError::LastSession(*name));
        }
        let removed = self
            .records
            .remove(name)
            .ok_or(ChainError::NotFound(*name))?;
        let next = self.order[pos + 1];
        if let Some(successor) = self.records.get_mut(&next) {
            successor.previous = removed.previous;
        }
        self.order.remove(pos);
        self.reindex();
        debug!(session = %name, successor = %next, "session spliced out");
        Ok(removed)
    }

    /// Replace the stored record of an existing session, keeping its linkage.
    pub fn update(&mut self, record: SessionRecord) -> ChainResult<()> {
        let existing = self
            .records
            .get_mut(&record.name)
            .ok_or(ChainError::NotFound(record.name))?;
        let previous = existing.previous;
        *existing = record;
        existing.previous = previous;
        Ok(())
    }

    /// Select a contiguous run of sessions strictly older than the last
    /// session, and the session it merges into.
    pub fn select_prune(&self, selector: &PruneSelector) -> ChainResult<PruneRun> {
        let Some(last) = self.order.last() else {
            return Err(ChainError::NothingToPrune);
        };
        if let PruneSelector::Single(name) = selector {
            if !self.contains(name) {
                return Err(ChainError::NotFound(*name));
            }
            if name == last {
                return Err(ChainError::LastSession(*name));
            }
        }

        let candidates = &self.order[..self.order.len() - 1];
        let selected: Vec<SessionName> = candidates
            .iter()
            .filter(|name| match selector {
                PruneSelector::Single(one) => *name == one,
                PruneSelector::Range { from, to } => *name >= from && *name <= to,
                PruneSelector::Before(bound) => *name < bound,
            })
            .copied()
            .collect();
        let (Some(first), Some(newest)) = (selected.first(), selected.last()) else {
            return Err(ChainError::NothingToPrune);
        };

        // Name filters over an ordered chain always select a contiguous run.
        debug_assert_eq!(self.position[newest] - self.position[first] + 1, selected.len());
        let target = self.order[self.position[newest] + 1];
        Ok(PruneRun {
            sessions: selected,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(day: u32) -> SessionName {
        format!("S_202401{day:02}-000000").parse().unwrap()
    }

    fn chain_of(days: &[u32]) -> SessionChain {
        let mut chain = SessionChain::new();
        for day in days {
            chain
                .append(SessionRecord::new(name(*day), 1 << 20, 65536))
                .unwrap();
        }
        chain
    }

    #[test]
    fn append_links_and_numbers() {
        let chain = chain_of(&[1, 2, 3]);
        assert_eq!(chain.first().unwrap().name, name(1));
        assert_eq!(chain.last().unwrap().name, name(3));
        assert_eq!(chain.get(&name(1)).unwrap().previous, None);
        assert_eq!(chain.get(&name(3)).unwrap().previous, Some(name(2)));
        assert_eq!(chain.get(&name(3)).unwrap().sequence, 2);
    }

    #[test]
    fn append_rejects_older_name() {
        let mut chain = chain_of(&[5]);
        let err = chain
            .append(SessionRecord::new(name(4), 1, 65536))
            .unwrap_err();
        assert!(matches!(err, ChainError::OutOfOrder { .. }));
        assert!(matches!(
            chain.append(SessionRecord::new(name(5), 1, 65536)),
            Err(ChainError::Duplicate(_))
        ));
    }

    #[test]
    fn rebuild_from_unordered_records() {
        let chain = chain_of(&[1, 2, 3, 4]);
        let mut records: Vec<SessionRecord> = chain.iter().cloned().collect();
        records.reverse();
        let rebuilt = SessionChain::from_records(records).unwrap();
        assert_eq!(rebuilt.names(), chain.names());
    }

    #[test]
    fn broken_chains_rejected() {
        let chain = chain_of(&[1, 2, 3]);
        let records: Vec<SessionRecord> = chain.iter().cloned().collect();

        let mut two_roots = records.clone();
        two_roots[2].previous = None;
        assert!(matches!(
            SessionChain::from_records(two_roots),
            Err(ChainError::MultipleRoots(_))
        ));

        let mut dangling = records.clone();
        dangling[1].previous = Some(name(9));
        assert!(matches!(
            SessionChain::from_records(dangling),
            Err(ChainError::Dangling { .. })
        ));

        let mut fork = records.clone();
        fork[2].previous = Some(name(1));
        assert!(matches!(
            SessionChain::from_records(fork),
            Err(ChainError::Fork(_))
        ));

        let mut cycle = records.clone();
        cycle[0].previous = Some(name(3));
        assert!(matches!(
            SessionChain::from_records(cycle),
            Err(ChainError::NoRoot)
        ));
    }

    #[test]
    fn detached_cycle_is_unreachable() {
        let mut records: Vec<SessionRecord> = chain_of(&[1, 2]).iter().cloned().collect();
        let mut a = SessionRecord::new(name(5), 1, 65536);
        let mut b = SessionRecord::new(name(6), 1, 65536);
        a.previous = Some(name(6));
        b.previous = Some(name(5));
        records.push(a);
        records.push(b);
        assert!(matches!(
            SessionChain::from_records(records),
            Err(ChainError::Unreachable(v)) if v == vec![name(5), name(6)]
        ));
    }

    #[test]
    fn delete_splices() {
        let mut chain = chain_of(&[1, 2, 3]);
        chain.delete(&name(2)).unwrap();
        assert_eq!(chain.names(), &[name(1), name(3)]);
        assert_eq!(chain.get(&name(3)).unwrap().previous, Some(name(1)));

        chain.delete(&name(1)).unwrap();
        assert_eq!(chain.first().unwrap().name, name(3));
        assert_eq!(chain.first().unwrap().previous, None);
    }

    #[test]
    fn delete_last_rejected() {
        let mut chain = chain_of(&[1, 2]);
        assert!(matches!(
            chain.delete(&name(2)),
            Err(ChainError::LastSession(_))
        ));
        assert!(matches!(
            chain.delete(&name(9)),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn ancestry_is_newest_first() {
        let chain = chain_of(&[1, 2, 3]);
        let names: Vec<SessionName> = chain
            .ancestry(&name(2))
            .unwrap()
            .iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec![name(2), name(1)]);
    }

    #[test]
    fn prune_single() {
        let chain = chain_of(&[1, 2, 3]);
        let run = chain.select_prune(&PruneSelector::Single(name(1))).unwrap();
        assert_eq!(run.sessions, vec![name(1)]);
        assert_eq!(run.target, name(2));
        assert!(matches!(
            chain.select_prune(&PruneSelector::Single(name(3))),
            Err(ChainError::LastSession(_))
        ));
    }

    #[test]
    fn prune_range_excludes_last() {
        let chain = chain_of(&[1, 2, 3, 4]);
        let run = chain
            .select_prune(&PruneSelector::Range {
                from: name(2),
                to: name(9),
            })
            .unwrap();
        assert_eq!(run.sessions, vec![name(2), name(3)]);
        assert_eq!(run.target, name(4));
    }

    #[test]
    fn prune_before() {
        let chain = chain_of(&[1, 2, 3, 4]);
        let run = chain.select_prune(&PruneSelector::Before(name(3))).unwrap();
        assert_eq!(run.sessions, vec![name(1), name(2)]);
        assert_eq!(run.target, name(3));
        assert!(matches!(
            chain.select_prune(&PruneSelector::Before(name(1))),
            Err(ChainError::NothingToPrune)
        ));
    }

    #[test]
    fn update_keeps_linkage() {
        let mut chain = chain_of(&[1, 2]);
        let mut rec = chain.get(&name(2)).unwrap().clone();
        rec.previous = None;
        rec.volume_size = 42;
        chain.update(rec).unwrap();
        let stored = chain.get(&name(2)).unwrap();
        assert_eq!(stored.volume_size, 42);
        assert_eq!(stored.previous, Some(name(1)));
    }
}
