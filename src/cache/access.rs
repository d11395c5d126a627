//! Evicted-access tracking for the running transaction.
//!
//! Every dereference of an evicted stub is recorded here. At the engine's
//! decision point the accumulated access set is classified:
//!
//! ```text
//! Clean ──record──▶ Touching ──decide──▶ Blockable | MustMerge
//!   ▲                                        │
//!   └──────────── init / merge ──────────────┘
//! ```
//!
//! `Blockable` means every touched block lives on a device whose policy allows
//! the merge to run inline while the transaction waits; `MustMerge` means the
//! transaction has to abort, the blocks are merged, and it is retried.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::cache::block::BlockId;
use crate::device::registry::{Device, DeviceId};
use crate::error::AntiCacheError;
use crate::table::{EvictedStub, TableId, TupleId};

/// Result of a tuple touch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// The tuple is in memory and the touch was applied.
    Resident,
    /// The tuple is evicted; the access was recorded and must be merged.
    RequiresMerge,
}

/// Classification of the current transaction's evicted accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessState {
    Clean,
    Touching,
    Blockable,
    MustMerge,
}

/// A block referenced by the access set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockRef {
    pub device: DeviceId,
    pub block_id: BlockId,
}

/// One dereference of an evicted stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub table: TableId,
    pub tuple: TupleId,
    pub device: DeviceId,
    pub block_id: BlockId,
    pub offset: i32,
}

impl AccessRecord {
    pub fn block(&self) -> BlockRef {
        BlockRef {
            device: self.device,
            block_id: self.block_id,
        }
    }
}

/// Payload of the evicted-access retry signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedAccessInterrupt {
    /// Distinct blocks to merge before the retry.
    pub blocks: Vec<BlockRef>,
    /// Number of distinct evicted tuples touched.
    pub tuples: usize,
    /// Whether the merge may run inline.
    pub blockable: bool,
}

/// Decides whether accesses to a device can be merged while the
/// transaction waits.
pub trait BlockingPolicy: Send + Sync {
    fn is_blockable(&self, device: &Device) -> bool;
}

/// Uses each device's configured `blockable` flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFlagPolicy;

impl BlockingPolicy for DeviceFlagPolicy {
    fn is_blockable(&self, device: &Device) -> bool {
        device.blockable()
    }
}

/// Every access may block.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysBlock;

impl BlockingPolicy for AlwaysBlock {
    fn is_blockable(&self, _device: &Device) -> bool {
        true
    }
}

/// Every access aborts the transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverBlock;

impl BlockingPolicy for NeverBlock {
    fn is_blockable(&self, _device: &Device) -> bool {
        false
    }
}

/// Per-transaction evicted-access set.
#[derive(Debug)]
pub struct AccessTracker {
    records: Vec<AccessRecord>,
    /// Offsets already recorded, by block.
    filter: BTreeMap<BlockRef, BTreeSet<i32>>,
    blockable: bool,
    state: AccessState,
}

impl Default for AccessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessTracker {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            filter: BTreeMap::new(),
            blockable: true,
            state: AccessState::Clean,
        }
    }

    /// Reset all tracking state; called at the start of every attempt.
    pub fn init(&mut self) {
        self.records.clear();
        self.filter.clear();
        self.blockable = true;
        self.state = AccessState::Clean;
    }

    /// Record a dereference of `stub`. `blockable` is the policy verdict for
    /// the stub's device. Returns false if the same tuple was already recorded.
    pub fn record(&mut self, table: TableId, tuple: TupleId, stub: EvictedStub, blockable: bool) -> bool {
        let block = BlockRef {
            device: stub.device_id,
            block_id: stub.block_id,
        };
        if !self
            .filter
            .entry(block)
            .or_default()
            .insert(stub.offset_in_block)
        {
            return false;
        }

        self.records.push(AccessRecord {
            table,
            tuple,
            device: stub.device_id,
            block_id: stub.block_id,
            offset: stub.offset_in_block,
        });
        if !blockable {
            self.blockable = false;
        }
        self.state = AccessState::Touching;
        debug!(
            table = %table,
            tuple,
            device = %stub.device_id,
            block_id = stub.block_id,
            offset = stub.offset_in_block,
            blockable,
            "Recorded evicted access"
        );
        true
    }

    pub fn has_evicted_accesses(&self) -> bool {
        !self.records.is_empty()
    }

    /// Whether the recorded accesses can all be merged inline.
    pub fn has_blockable_evicted_accesses(&self) -> bool {
        self.has_evicted_accesses() && self.blockable
    }

    /// Resolve `Touching` into `Blockable` or `MustMerge`.
    pub fn decide(&mut self) -> AccessState {
        if self.state == AccessState::Touching {
            self.state = if self.blockable {
                AccessState::Blockable
            } else {
                AccessState::MustMerge
            };
        }
        self.state
    }

    pub fn state(&self) -> AccessState {
        self.state
    }

    pub fn records(&self) -> &[AccessRecord] {
        &self.records
    }

    /// Distinct blocks touched, in (device, block) order.
    pub fn blocks(&self) -> Vec<BlockRef> {
        self.filter.keys().copied().collect()
    }

    /// Whether any recorded access points into `block_id`, on any device.
    pub fn references_block(&self, block_id: BlockId) -> bool {
        self.filter.keys().any(|b| b.block_id == block_id)
    }

    /// Build the retry signal for the current access set.
    pub fn interrupt(&mut self) -> AntiCacheError {
        if !self.has_evicted_accesses() {
            return AntiCacheError::NoEvictedAccess;
        }
        self.decide();
        AntiCacheError::EvictedAccess(EvictedAccessInterrupt {
            blocks: self.blocks(),
            tuples: self.records.len(),
            blockable: self.blockable,
        })
    }

    /// Take the access set grouped by block, leaving the tracker clean.
    pub fn drain(&mut self) -> BTreeMap<BlockRef, Vec<AccessRecord>> {
        let mut grouped: BTreeMap<BlockRef, Vec<AccessRecord>> = BTreeMap::new();
        for record in self.records.drain(..) {
            grouped.entry(record.block()).or_default().push(record);
        }
        self.init();
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(block_id: BlockId, offset: i32) -> EvictedStub {
        EvictedStub {
            device_id: DeviceId::new(0),
            block_id,
            offset_in_block: offset,
        }
    }

    #[test]
    fn test_state_machine() {
        let mut tracker = AccessTracker::new();
        assert_eq!(tracker.state(), AccessState::Clean);
        assert!(!tracker.has_evicted_accesses());
        assert!(!tracker.has_blockable_evicted_accesses());

        tracker.record(TableId(0), 1, stub(10, 0), true);
        assert_eq!(tracker.state(), AccessState::Touching);
        assert!(tracker.has_blockable_evicted_accesses());
        assert_eq!(tracker.decide(), AccessState::Blockable);

        tracker.record(TableId(0), 5, stub(11, 2), false);
        assert!(!tracker.has_blockable_evicted_accesses());
        assert_eq!(tracker.decide(), AccessState::MustMerge);

        tracker.init();
        assert_eq!(tracker.state(), AccessState::Clean);
        assert!(tracker.has_blockable_evicted_accesses() == tracker.has_evicted_accesses());
    }

    #[test]
    fn test_dedup_by_block_and_offset() {
        let mut tracker = AccessTracker::new();
        assert!(tracker.record(TableId(0), 1, stub(10, 0), true));
        assert!(!tracker.record(TableId(0), 1, stub(10, 0), true));
        assert!(tracker.record(TableId(0), 2, stub(10, 1), true));
        assert!(tracker.record(TableId(0), 7, stub(12, 0), true));

        assert_eq!(tracker.records().len(), 3);
        assert_eq!(tracker.blocks().len(), 2);
        assert!(tracker.references_block(12));
        assert!(!tracker.references_block(11));

        let grouped = tracker.drain();
        assert_eq!(grouped.len(), 2);
        let first = grouped.values().next().unwrap();
        assert_eq!(first.iter().map(|r| r.tuple).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!tracker.has_evicted_accesses());
        assert!(!tracker.references_block(10));
    }

    #[test]
    fn test_interrupt_requires_access() {
        let mut tracker = AccessTracker::new();
        assert!(matches!(tracker.interrupt(), AntiCacheError::NoEvictedAccess));

        tracker.record(TableId(2), 3, stub(4, 0), false);
        match tracker.interrupt() {
            AntiCacheError::EvictedAccess(signal) => {
                assert_eq!(signal.tuples, 1);
                assert!(!signal.blockable);
                assert_eq!(signal.blocks[0].block_id, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.state(), AccessState::MustMerge);
    }
}
