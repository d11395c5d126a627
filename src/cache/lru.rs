//! Per-table LRU chains of resident tuples.
//!
//! Each chain is an arena of links indexed by [`TupleId`]. Links point from
//! older to newer (`newer`), so the least-recently-used end can always be
//! walked forward; a doubly-linked chain also keeps `older` links for O(1)
//! unlinking, while a singly-linked chain finds the predecessor by scanning
//! from the LRU end.
//!
//! Every link carries the recency stamp of its last touch. Single touches get
//! a fresh stamp; batch admissions share one stamp and are appended in
//! ascending id order, so among equal stamps the lower id is always closer to
//! the LRU end and is evicted first.

use std::collections::HashMap;

use tracing::trace;

use crate::config::ChainKind;
use crate::error::{AntiCacheError, Result};
use crate::table::{Table, TableId, TupleId};

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    newer: Option<TupleId>,
    older: Option<TupleId>,
    stamp: u64,
    linked: bool,
}

/// Recency chain for one table.
#[derive(Debug)]
pub struct LruChain {
    kind: ChainKind,
    links: Vec<Link>,
    oldest: Option<TupleId>,
    newest: Option<TupleId>,
    len: usize,
}

impl LruChain {
    pub fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            links: Vec::new(),
            oldest: None,
            newest: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: TupleId) -> bool {
        self.links.get(id as usize).is_some_and(|l| l.linked)
    }

    /// Stamp of the tuple's last touch, if linked.
    pub fn stamp(&self, id: TupleId) -> Option<u64> {
        self.links
            .get(id as usize)
            .filter(|l| l.linked)
            .map(|l| l.stamp)
    }

    pub fn oldest(&self) -> Option<TupleId> {
        self.oldest
    }

    pub fn newest(&self) -> Option<TupleId> {
        self.newest
    }

    fn newer_of(&self, id: TupleId) -> Option<TupleId> {
        self.links.get(id as usize).and_then(|l| l.newer)
    }

    /// Append at the MRU end.
    fn push_newest(&mut self, id: TupleId, stamp: u64) {
        let idx = id as usize;
        if idx >= self.links.len() {
            self.links.resize(idx + 1, Link::default());
        }
        let prev_newest = self.newest;
        self.links[idx] = Link {
            newer: None,
            older: match self.kind {
                ChainKind::Doubly => prev_newest,
                ChainKind::Singly => None,
            },
            stamp,
            linked: true,
        };
        match prev_newest {
            Some(n) => self.links[n as usize].newer = Some(id),
            None => self.oldest = Some(id),
        }
        self.newest = Some(id);
        self.len += 1;
    }

    /// Unlink a tuple. Returns false if it was not in the chain.
    fn unlink(&mut self, id: TupleId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let link = self.links[id as usize];
        let older = match self.kind {
            ChainKind::Doubly => link.older,
            ChainKind::Singly => self.scan_older(id),
        };

        match older {
            Some(o) => self.links[o as usize].newer = link.newer,
            None => self.oldest = link.newer,
        }
        match link.newer {
            Some(n) => {
                if self.kind == ChainKind::Doubly {
                    self.links[n as usize].older = older;
                }
            }
            None => self.newest = older,
        }

        self.links[id as usize] = Link::default();
        self.len -= 1;
        true
    }

    /// Predecessor of `id` toward the LRU end, found by walking from it.
    fn scan_older(&self, id: TupleId) -> Option<TupleId> {
        let mut cursor = self.oldest;
        let mut prev = None;
        while let Some(cur) = cursor {
            if cur == id {
                return prev;
            }
            prev = Some(cur);
            cursor = self.newer_of(cur);
        }
        None
    }

    /// Tuple ids from the LRU end to the MRU end.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = TupleId> + '_ {
        std::iter::successors(self.oldest, move |&id| self.newer_of(id))
    }
}

/// Tracks tuple recency for every table of a partition.
#[derive(Debug)]
pub struct LruTracker {
    kind: ChainKind,
    chains: HashMap<TableId, LruChain>,
    clock: u64,
}

impl LruTracker {
    pub fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            chains: HashMap::new(),
            clock: 0,
        }
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    /// Create an empty chain for `table`. Existing chains are kept.
    pub fn init_table(&mut self, table: TableId) {
        let kind = self.kind;
        self.chains.entry(table).or_insert_with(|| LruChain::new(kind));
    }

    pub fn chain(&self, table: TableId) -> Option<&LruChain> {
        self.chains.get(&table)
    }

    fn chain_mut(&mut self, table: TableId) -> Result<&mut LruChain> {
        self.chains
            .get_mut(&table)
            .ok_or(AntiCacheError::ChainNotInitialized(table))
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Move a tuple to the MRU end. Inserts get a new link; updates of a
    /// tuple not yet in the chain link it.
    pub fn on_insert_or_update(&mut self, table: TableId, tuple: TupleId, is_insert: bool) -> Result<()> {
        let stamp = self.next_stamp();
        let chain = self.chain_mut(table)?;
        let relinked = chain.unlink(tuple);
        debug_assert!(!(is_insert && relinked), "insert of an already linked tuple");
        chain.push_newest(tuple, stamp);
        trace!(table = %table, tuple, is_insert, stamp, "Touched tuple");
        Ok(())
    }

    /// Re-admit a previously evicted tuple at the MRU end.
    pub fn on_unevict(&mut self, table: TableId, tuple: TupleId) -> Result<()> {
        self.on_unevict_batch(table, &[tuple])
    }

    /// Re-admit several tuples with one shared stamp, lowest id nearest the
    /// LRU end.
    pub fn on_unevict_batch(&mut self, table: TableId, tuples: &[TupleId]) -> Result<()> {
        if tuples.is_empty() {
            return Ok(());
        }
        let stamp = self.next_stamp();
        let chain = self.chain_mut(table)?;
        let mut ids = tuples.to_vec();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            chain.unlink(id);
            chain.push_newest(id, stamp);
        }
        Ok(())
    }

    /// Unlink a tuple. Returns whether it was present.
    pub fn on_remove(&mut self, table: TableId, tuple: TupleId) -> Result<bool> {
        let chain = self.chain_mut(table)?;
        Ok(chain.unlink(tuple))
    }

    /// Lazily walk eviction candidates from the LRU end of `table`'s chain.
    pub fn select_eviction_candidates<'a>(
        &'a self,
        table: &'a Table,
        target_bytes: usize,
    ) -> Result<EvictionCandidates<'a>> {
        let chain = self
            .chains
            .get(&table.id())
            .ok_or(AntiCacheError::ChainNotInitialized(table.id()))?;
        Ok(EvictionCandidates {
            chain,
            table,
            cursor: chain.oldest,
            budget: target_bytes,
            used: 0,
            spare: None,
            dependents: None,
            spared: Vec::new(),
        })
    }

    /// Chain contents, MRU first.
    pub fn chain_snapshot(&self, table: TableId) -> Vec<TupleId> {
        let mut ids: Vec<TupleId> = self
            .chains
            .get(&table)
            .map(|c| c.iter_oldest_first().collect())
            .unwrap_or_default();
        ids.reverse();
        ids
    }

    /// Check that the chain holds exactly the table's resident tuples, with
    /// stamps non-increasing toward the LRU end and equal stamps in ascending
    /// id order from that end.
    pub fn validate(&self, table: &Table) -> std::result::Result<(), String> {
        let chain = self
            .chains
            .get(&table.id())
            .ok_or_else(|| format!("no chain for table {}", table.id()))?;

        let mut seen = Vec::with_capacity(chain.len());
        let mut prev: Option<(u64, TupleId)> = None;
        for id in chain.iter_oldest_first() {
            if seen.len() > chain.len() {
                return Err("chain has a cycle".to_string());
            }
            let stamp = chain.stamp(id).ok_or_else(|| format!("tuple {id} linked without stamp"))?;
            if let Some((ps, pid)) = prev {
                if stamp < ps || (stamp == ps && id < pid) {
                    return Err(format!(
                        "tuple {id} (stamp {stamp}) is newer than tuple {pid} (stamp {ps})"
                    ));
                }
            }
            if !table.slot(id).is_some_and(|s| s.is_resident()) {
                return Err(format!("tuple {id} is chained but not resident"));
            }
            prev = Some((stamp, id));
            seen.push(id);
        }
        if seen.len() != chain.len() {
            return Err(format!("walked {} links, length is {}", seen.len(), chain.len()));
        }

        seen.sort_unstable();
        let resident = table.resident_ids();
        if seen != resident {
            return Err(format!("chain {seen:?} != resident {resident:?}"));
        }
        Ok(())
    }
}

/// Restartable walk over eviction candidates.
///
/// Yields tuple ids from the LRU end while the cumulative serialized size
/// (including dependents, if configured) stays within the budget. When the
/// next tuple does not fit the walk stops without consuming it; calling
/// [`EvictionCandidates::restart`] with a new budget continues from there.
pub struct EvictionCandidates<'a> {
    chain: &'a LruChain,
    table: &'a Table,
    cursor: Option<TupleId>,
    budget: usize,
    used: usize,
    spare: Option<&'a dyn Fn(TupleId) -> bool>,
    dependents: Option<&'a dyn Fn(TupleId) -> usize>,
    spared: Vec<TupleId>,
}

impl<'a> EvictionCandidates<'a> {
    /// Skip tuples for which `spare` returns true; they are collected in
    /// [`EvictionCandidates::spared`].
    pub fn sparing(mut self, spare: &'a dyn Fn(TupleId) -> bool) -> Self {
        self.spare = Some(spare);
        self
    }

    /// Charge `extra(id)` bytes of co-located rows for every candidate.
    pub fn with_dependents(mut self, extra: &'a dyn Fn(TupleId) -> usize) -> Self {
        self.dependents = Some(extra);
        self
    }

    /// Start a new block budget from the current position.
    pub fn restart(&mut self, target_bytes: usize) {
        self.budget = target_bytes;
        self.used = 0;
    }

    /// Bytes charged in the current budget.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn spared(&self) -> &[TupleId] {
        &self.spared
    }
}

impl Iterator for EvictionCandidates<'_> {
    type Item = TupleId;

    fn next(&mut self) -> Option<TupleId> {
        loop {
            let id = self.cursor?;
            let Some(tuple) = self.table.tuple(id) else {
                // Chained but not resident; never evict it.
                self.cursor = self.chain.newer_of(id);
                continue;
            };
            if self.spare.is_some_and(|spare| spare(id)) {
                self.spared.push(id);
                self.cursor = self.chain.newer_of(id);
                continue;
            }
            let size = tuple.serialized_size() + self.dependents.map_or(0, |extra| extra(id));
            if self.used + size > self.budget {
                return None;
            }
            self.used += size;
            self.cursor = self.chain.newer_of(id);
            return Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Tuple;

    fn table_with(n: usize, size: usize) -> Table {
        let mut table = Table::new(TableId(0), "t");
        for _ in 0..n {
            table.insert(Tuple::new(vec![0u8; size]));
        }
        table
    }

    fn tracker_for(table: &Table, kind: ChainKind) -> LruTracker {
        let mut lru = LruTracker::new(kind);
        lru.init_table(table.id());
        for id in table.resident_ids() {
            lru.on_insert_or_update(table.id(), id, true).unwrap();
        }
        lru
    }

    #[test]
    fn test_insert_order() {
        let table = table_with(5, 8);
        let lru = tracker_for(&table, ChainKind::Doubly);
        assert_eq!(lru.chain_snapshot(table.id()), vec![4, 3, 2, 1, 0]);
        assert!(lru.validate(&table).is_ok());
    }

    #[test]
    fn test_uninitialized_chain() {
        let mut lru = LruTracker::new(ChainKind::Doubly);
        assert!(matches!(
            lru.on_insert_or_update(TableId(3), 0, true),
            Err(AntiCacheError::ChainNotInitialized(TableId(3)))
        ));
    }

    #[test]
    fn test_touch_and_remove_both_kinds() {
        for kind in [ChainKind::Doubly, ChainKind::Singly] {
            let mut table = table_with(5, 8);
            let mut lru = tracker_for(&table, kind);
            let t = table.id();

            lru.on_insert_or_update(t, 1, false).unwrap();
            assert_eq!(lru.chain_snapshot(t), vec![1, 4, 3, 2, 0]);

            // Middle, oldest and newest removal.
            assert!(lru.on_remove(t, 3).unwrap());
            assert!(lru.on_remove(t, 0).unwrap());
            assert!(lru.on_remove(t, 1).unwrap());
            assert!(!lru.on_remove(t, 1).unwrap());
            assert_eq!(lru.chain_snapshot(t), vec![4, 2]);
            assert_eq!(lru.chain(t).unwrap().oldest(), Some(2));
            assert_eq!(lru.chain(t).unwrap().newest(), Some(4));

            for id in [0, 1, 3] {
                table.delete(id);
            }
            assert!(lru.validate(&table).is_ok(), "{kind:?}");
        }
    }

    #[test]
    fn test_batch_unevict_orders_by_id() {
        let table = table_with(6, 8);
        let mut lru = tracker_for(&table, ChainKind::Doubly);
        let t = table.id();
        lru.on_unevict_batch(t, &[5, 1, 3]).unwrap();
        assert_eq!(lru.chain_snapshot(t), vec![5, 3, 1, 4, 2, 0]);
        assert_eq!(lru.chain(t).unwrap().stamp(1), lru.chain(t).unwrap().stamp(5));
        assert!(lru.validate(&table).is_ok());
    }

    #[test]
    fn test_candidates_respect_budget_and_restart() {
        let table = table_with(5, 76); // 100 bytes serialized each
        let lru = tracker_for(&table, ChainKind::Doubly);

        let mut candidates = lru.select_eviction_candidates(&table, 250).unwrap();
        let first: Vec<_> = candidates.by_ref().collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(candidates.used(), 200);

        candidates.restart(1000);
        let rest: Vec<_> = candidates.by_ref().collect();
        assert_eq!(rest, vec![2, 3, 4]);
        assert!(candidates.is_exhausted());
    }

    #[test]
    fn test_candidates_sparing() {
        let table = table_with(4, 76);
        let lru = tracker_for(&table, ChainKind::Singly);
        let hot = |id: TupleId| id == 1;
        let mut candidates = lru
            .select_eviction_candidates(&table, 10_000)
            .unwrap()
            .sparing(&hot);
        let picked: Vec<_> = candidates.by_ref().collect();
        assert_eq!(picked, vec![0, 2, 3]);
        assert_eq!(candidates.spared(), &[1]);
    }

    #[test]
    fn test_validate_detects_stale_entry() {
        let mut table = table_with(3, 8);
        let lru = tracker_for(&table, ChainKind::Doubly);
        table.delete(1);
        assert!(lru.validate(&table).is_err());
    }
}
