//! Merging evicted blocks back into memory.
//!
//! A merge runs in two phases. [`MergeEngine::fetch`] reads every block the
//! transaction touched (concurrently, one read per block) and decodes it;
//! nothing is mutated, so a corrupt or missing block fails the merge with the
//! tables intact. [`MergeEngine::merge_unevicted_tuples`] then restores the
//! fetched tuples of one table, re-links them at the MRU end of its chain and
//! releases their offsets on the device. A block is deleted from its device
//! once none of its members remain evicted.
//!
//! In [`MergeMode::Block`] every still-evicted member of a fetched block is
//! restored. In [`MergeMode::Tuple`] only the requested tuples are, and the
//! block stays on the device until its remaining members are requested too.
//! Parent/child batch blocks are always merged whole.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, error};

use crate::cache::access::{AccessRecord, BlockRef};
use crate::cache::block::{Block, BlockCodec, BlockId};
use crate::cache::lru::LruTracker;
use crate::config::MergeMode;
use crate::device::registry::{DeviceError, DeviceId, DeviceRegistry};
use crate::error::{AntiCacheError, Result};
use crate::table::{Catalog, EvictedStub, TableId, Tuple, TupleId};

/// A fetched, decoded block awaiting merge.
#[derive(Debug, Clone)]
struct FetchedBlock {
    block: BlockRef,
    contents: Block,
    /// Offsets still evicted.
    live: Vec<bool>,
    requested: BTreeSet<i32>,
    batched: bool,
}

impl FetchedBlock {
    fn restores(&self, mode: MergeMode, offset: usize) -> bool {
        self.live.get(offset).copied().unwrap_or(false)
            && (mode == MergeMode::Block || self.batched || self.requested.contains(&(offset as i32)))
    }

    fn has_pending(&self, mode: MergeMode) -> bool {
        (0..self.live.len()).any(|offset| self.restores(mode, offset))
    }
}

/// One restored tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedRow {
    pub table: TableId,
    pub tuple: TupleId,
    pub device: DeviceId,
    pub block_id: BlockId,
    pub offset: i32,
    pub requested: bool,
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    /// Blocks deleted from their device by this merge.
    pub blocks_released: usize,
    pub rows: Vec<MergedRow>,
}

impl MergeResult {
    pub fn tuples_merged(&self) -> usize {
        self.rows.len()
    }

    pub fn extend(&mut self, other: MergeResult) {
        self.blocks_released += other.blocks_released;
        self.rows.extend(other.rows);
    }
}

fn corrupt(block: BlockRef, reason: impl Into<String>) -> AntiCacheError {
    AntiCacheError::CorruptBlock {
        device: block.device,
        block_id: block.block_id,
        reason: reason.into(),
    }
}

/// The merge engine.
#[derive(Debug)]
pub struct MergeEngine {
    codec: BlockCodec,
    mode: MergeMode,
    pending: Vec<FetchedBlock>,
}

impl MergeEngine {
    pub fn new(codec: BlockCodec, mode: MergeMode) -> Self {
        Self {
            codec,
            mode,
            pending: Vec::new(),
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Blocks fetched and not yet fully merged.
    pub fn pending_blocks(&self) -> Vec<BlockRef> {
        self.pending.iter().map(|f| f.block).collect()
    }

    /// Tables with tuples waiting in fetched blocks.
    pub fn pending_tables(&self) -> Vec<TableId> {
        let mode = self.mode;
        let tables: BTreeSet<TableId> = self
            .pending
            .iter()
            .flat_map(|f| {
                f.contents
                    .entries
                    .iter()
                    .enumerate()
                    .filter(move |(offset, _)| f.restores(mode, *offset))
                    .map(|(_, e)| e.table)
            })
            .collect();
        tables.into_iter().collect()
    }

    async fn fetch_one(
        &self,
        registry: &DeviceRegistry,
        block: BlockRef,
        records: Vec<AccessRecord>,
    ) -> Result<FetchedBlock> {
        // Any read failure here leaves the access set unservable.
        let missing = |e: DeviceError| match e {
            DeviceError::UnknownBlock { .. } | DeviceError::UnknownDevice(_) => {
                corrupt(block, "block is not on its device")
            }
            other => corrupt(block, format!("read failed: {other}")),
        };
        let data = registry
            .read_block(block.device, block.block_id)
            .await
            .map_err(missing)?;
        let members = registry
            .block_members(block.device, block.block_id)
            .await
            .map_err(missing)?;
        let contents = self
            .codec
            .decode(&data)
            .map_err(|e| corrupt(block, e.to_string()))?;

        if contents.len() != members.len() {
            return Err(corrupt(
                block,
                format!("{} entries decoded, {} registered", contents.len(), members.len()),
            ));
        }
        for (offset, (entry, member)) in contents.entries.iter().zip(&members).enumerate() {
            if let Some(m) = member {
                if m.table != entry.table || m.tuple != entry.tuple {
                    return Err(corrupt(block, format!("offset {offset} holds a different tuple")));
                }
            }
        }

        let batched = contents.is_batched();
        Ok(FetchedBlock {
            block,
            live: members.iter().map(Option::is_some).collect(),
            requested: records.iter().map(|r| r.offset).collect(),
            batched,
            contents,
        })
    }

    /// Read and decode every block in the access set.
    ///
    /// Blocks are read from the device that holds them now, which may differ
    /// from the device their stubs named when the access was recorded.
    pub async fn fetch(
        &mut self,
        registry: &DeviceRegistry,
        recorded: BTreeMap<BlockRef, Vec<AccessRecord>>,
    ) -> Result<usize> {
        let mut groups: BTreeMap<BlockRef, Vec<AccessRecord>> = BTreeMap::new();
        for (block, records) in recorded {
            let device = registry.locate(block.block_id).await.unwrap_or(block.device);
            if device != block.device {
                debug!(block_id = block.block_id, from = %block.device, to = %device, "Block moved since access");
            }
            groups
                .entry(BlockRef {
                    device,
                    block_id: block.block_id,
                })
                .or_default()
                .extend(records);
        }

        for fetched in self.pending.iter_mut() {
            if let Some(records) = groups.remove(&fetched.block) {
                fetched.requested.extend(records.iter().map(|r| r.offset));
            }
        }
        let reads = groups
            .into_iter()
            .map(|(block, records)| self.fetch_one(registry, block, records));

        let fetched = match try_join_all(reads).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(error = %e, "Failed to fetch evicted blocks");
                return Err(e);
            }
        };
        let count = fetched.len();
        debug!(blocks = count, "Fetched evicted blocks");
        self.pending.extend(fetched);
        Ok(count)
    }

    /// Restore the fetched tuples of `table_id` and release their offsets.
    ///
    /// Un-requested tuples are re-admitted to the chain first and requested
    /// ones after them, so the tuples the transaction actually needs end up
    /// most recent.
    pub async fn merge_unevicted_tuples(
        &mut self,
        table_id: TableId,
        catalog: &mut Catalog,
        lru: &mut LruTracker,
        registry: &DeviceRegistry,
    ) -> Result<MergeResult> {
        let mode = self.mode;
        let table = catalog
            .get_mut(table_id)
            .ok_or(AntiCacheError::UnknownTable(table_id))?;

        // Validate every stub before touching the table.
        let mut restores: Vec<(usize, usize)> = Vec::new();
        for (idx, fetched) in self.pending.iter().enumerate() {
            for (offset, entry) in fetched.contents.entries.iter().enumerate() {
                if entry.table != table_id || !fetched.restores(mode, offset) {
                    continue;
                }
                let expected = EvictedStub {
                    device_id: fetched.block.device,
                    block_id: fetched.block.block_id,
                    offset_in_block: offset as i32,
                };
                if table.slot(entry.tuple).and_then(|s| s.stub()) != Some(expected) {
                    let err = corrupt(
                        fetched.block,
                        format!("tuple {} of {} no longer references offset {offset}", entry.tuple, table_id),
                    );
                    error!(error = %err, "Merge aborted");
                    return Err(err);
                }
                restores.push((idx, offset));
            }
        }

        let mut result = MergeResult::default();
        let mut unrequested = Vec::new();
        let mut requested = Vec::new();
        let mut released: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
        for (idx, offset) in restores {
            let fetched = &mut self.pending[idx];
            let entry = &fetched.contents.entries[offset];
            let tuple: Tuple = entry.to_tuple();
            table.restore(entry.tuple, tuple);
            fetched.live[offset] = false;

            let was_requested = fetched.requested.contains(&(offset as i32));
            if was_requested {
                requested.push(entry.tuple);
            } else {
                unrequested.push(entry.tuple);
            }
            released.entry(idx).or_default().push(offset as i32);
            result.rows.push(MergedRow {
                table: table_id,
                tuple: entry.tuple,
                device: fetched.block.device,
                block_id: fetched.block.block_id,
                offset: offset as i32,
                requested: was_requested,
            });
        }
        lru.on_unevict_batch(table_id, &unrequested)?;
        lru.on_unevict_batch(table_id, &requested)?;

        for (idx, offsets) in released {
            let block = self.pending[idx].block;
            if registry
                .release_members(block.device, block.block_id, &offsets)
                .await?
            {
                result.blocks_released += 1;
            }
        }
        self.pending.retain(|f| f.has_pending(mode));

        debug!(
            table = %table_id,
            tuples = result.rows.len(),
            blocks_released = result.blocks_released,
            "Merged evicted tuples"
        );
        Ok(result)
    }

    /// Discard fetched blocks without merging them. Called when a merge
    /// fails, so nothing carries over into the next one.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Read one tuple from an evicted block without restoring anything.
    pub async fn read_evicted_block(
        &self,
        registry: &DeviceRegistry,
        table: TableId,
        block_id: BlockId,
        offset: i32,
    ) -> Result<Tuple> {
        let device = registry
            .locate(block_id)
            .await
            .ok_or(DeviceError::UnknownBlock {
                device: DeviceId::new(0),
                block_id,
            })?;
        let block = BlockRef { device, block_id };
        let data = registry.read_block(device, block_id).await?;
        let contents = self
            .codec
            .decode(&data)
            .map_err(|e| corrupt(block, e.to_string()))?;
        contents
            .entry(offset)
            .filter(|e| e.table == table)
            .map(|e| e.to_tuple())
            .ok_or(AntiCacheError::TupleNotFound {
                table,
                tuple: offset.max(0) as TupleId,
            })
    }
}
