//! Eviction: decides which resident tuples leave memory and packs them into
//! blocks.
//!
//! Planning walks a table's LRU chain from the least-recently-used end and
//! never mutates anything, so the same plan serves both the dry-run
//! operations (which only report what would be evicted) and the write path.
//! Writing follows a strict order: the block is encoded and stored on the
//! device first, and only then are the tuples swapped for stubs and unlinked
//! from their chains. A failed write leaves every table untouched.
//!
//! Batch eviction co-locates each parent tuple with its resident children;
//! the children's bytes are charged to the same block budget.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::cache::block::{Block, BlockCodec, BlockEntry, BlockId, BLOCK_OVERHEAD_BYTES};
use crate::cache::lru::LruTracker;
use crate::cache::sketch::{tuple_key, FrequencySketch};
use crate::device::registry::{BlockMember, DeviceId, DeviceRegistry, NewBlock, Reservation};
use crate::error::{AntiCacheError, Result};
use crate::table::{EvictedStub, Table, TableId, TupleId};

/// Tuples chosen for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBlock {
    /// Parent (or only) table tuples, LRU first.
    pub tuples: Vec<TupleId>,
    /// Child table tuples co-located with `tuples`.
    pub children: Vec<TupleId>,
    /// Serialized bytes charged against the block budget.
    pub bytes: usize,
}

impl PlannedBlock {
    pub fn len(&self) -> usize {
        self.tuples.len() + self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

/// Output of the planner.
#[derive(Debug, Clone, Default)]
pub struct EvictionPlan {
    pub blocks: Vec<PlannedBlock>,
    /// Hot tuples passed over by the walk; they earn a second chance.
    pub spared: Vec<TupleId>,
}

/// One row of the eviction result relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedRow {
    pub table: TableId,
    pub tuple: TupleId,
    pub offset: i32,
}

/// One block of the eviction result relation. `device` and `block_id` are
/// unset for planned blocks that were never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub device: Option<DeviceId>,
    pub block_id: Option<BlockId>,
    pub bytes: usize,
    pub rows: Vec<EvictedRow>,
}

/// Result relation of an eviction operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionResult {
    pub table: String,
    pub dry_run: bool,
    pub blocks: Vec<BlockSummary>,
}

impl EvictionResult {
    pub fn tuples_evicted(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.len()).sum()
    }

    pub fn blocks_evicted(&self) -> usize {
        self.blocks.len()
    }

    pub fn bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.bytes).sum()
    }
}

/// Resident children of every parent tuple, with their total size.
fn children_index(child: &Table) -> HashMap<TupleId, (Vec<TupleId>, usize)> {
    let mut index: HashMap<TupleId, (Vec<TupleId>, usize)> = HashMap::new();
    for id in child.resident_ids() {
        let Some(tuple) = child.tuple(id) else { continue };
        if let Some(parent) = tuple.parent {
            let entry = index.entry(parent).or_default();
            entry.0.push(id);
            entry.1 += tuple.serialized_size();
        }
    }
    index
}

/// The eviction engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    codec: BlockCodec,
}

impl Evictor {
    pub fn new(codec: BlockCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &BlockCodec {
        &self.codec
    }

    /// Choose up to `num_blocks` blocks of at most `block_size` bytes from
    /// the LRU end of `table`, co-locating children from `child` if given.
    ///
    /// Tuples the sketch reports hot are skipped. Planning stops early when
    /// the chain is exhausted or the next tuple cannot fit an empty block.
    pub fn plan(
        &self,
        table: &Table,
        child: Option<&Table>,
        lru: &LruTracker,
        sketch: Option<&FrequencySketch>,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<EvictionPlan> {
        let budget = block_size.saturating_sub(BLOCK_OVERHEAD_BYTES);
        let index = child.map(children_index).unwrap_or_default();
        let table_id = table.id();

        let hot = |id: TupleId| sketch.is_some_and(|s| s.is_hot(tuple_key(table_id, id)));
        let dependents = |id: TupleId| index.get(&id).map_or(0, |(_, bytes)| *bytes);

        let mut candidates = lru
            .select_eviction_candidates(table, budget)?
            .sparing(&hot)
            .with_dependents(&dependents);

        let mut plan = EvictionPlan::default();
        for _ in 0..num_blocks {
            let tuples: Vec<TupleId> = candidates.by_ref().collect();
            if tuples.is_empty() {
                break;
            }
            let children = tuples
                .iter()
                .filter_map(|id| index.get(id))
                .flat_map(|(kids, _)| kids.iter().copied())
                .collect();
            plan.blocks.push(PlannedBlock {
                tuples,
                children,
                bytes: candidates.used(),
            });
            if candidates.is_exhausted() {
                break;
            }
            candidates.restart(budget);
        }
        plan.spared = candidates.spared().to_vec();

        trace!(
            table = %table_id,
            blocks = plan.blocks.len(),
            spared = plan.spared.len(),
            "Planned eviction"
        );
        Ok(plan)
    }

    /// Describe a plan without writing it.
    pub fn summarize(&self, table: &Table, child: Option<&Table>, plan: &EvictionPlan) -> EvictionResult {
        let blocks = plan
            .blocks
            .iter()
            .map(|planned| {
                let rows = planned
                    .tuples
                    .iter()
                    .map(|&id| (table.id(), id))
                    .chain(
                        child
                            .into_iter()
                            .flat_map(move |c| planned.children.iter().map(move |&id| (c.id(), id))),
                    )
                    .enumerate()
                    .map(|(offset, (table, tuple))| EvictedRow {
                        table,
                        tuple,
                        offset: offset as i32,
                    })
                    .collect();
                BlockSummary {
                    device: None,
                    block_id: None,
                    bytes: planned.bytes,
                    rows,
                }
            })
            .collect();
        EvictionResult {
            table: table.name().to_string(),
            dry_run: true,
            blocks,
        }
    }

    /// Assemble the block for a plan entry from the tables' current contents.
    fn assemble(&self, table: &Table, child: Option<&Table>, planned: &PlannedBlock) -> Result<(Block, Vec<BlockMember>)> {
        let mut block = Block::new(table.id());
        let mut members = Vec::with_capacity(planned.len());

        let parents = planned.tuples.iter().map(|&id| (table, id));
        let children = child
            .into_iter()
            .flat_map(move |c| planned.children.iter().map(move |&id| (c, id)));
        for (src, id) in parents.chain(children) {
            let tuple = src.tuple(id).ok_or(AntiCacheError::TupleNotFound {
                table: src.id(),
                tuple: id,
            })?;
            block.push(BlockEntry::new(src.id(), id, tuple));
            members.push(BlockMember {
                table: src.id(),
                tuple: id,
            });
        }
        Ok((block, members))
    }

    /// Write one planned block into `reservation` and swap its tuples for
    /// stubs. The reservation is consumed on every path.
    pub async fn write(
        &self,
        registry: &DeviceRegistry,
        reservation: Reservation,
        owner: u32,
        table: &mut Table,
        mut child: Option<&mut Table>,
        lru: &mut LruTracker,
        planned: &PlannedBlock,
    ) -> Result<BlockSummary> {
        let device = reservation.device();
        let prepared = self
            .assemble(table, child.as_deref(), planned)
            .and_then(|(block, members)| Ok((self.codec.encode(&block)?, block.is_batched(), members)));
        let (data, batched, members) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                registry.release(reservation);
                return Err(e);
            }
        };
        let block_id = registry
            .write_reserved(
                reservation,
                &data,
                NewBlock {
                    owner,
                    members: members.clone(),
                    batched,
                },
            )
            .await?;

        let mut rows = Vec::with_capacity(members.len());
        for (offset, member) in members.into_iter().enumerate() {
            let offset = offset as i32;
            let stub = EvictedStub {
                device_id: device,
                block_id,
                offset_in_block: offset,
            };
            let target: &mut Table = if member.table == table.id() {
                &mut *table
            } else {
                match child.as_deref_mut() {
                    Some(c) => c,
                    None => return Err(AntiCacheError::UnknownTable(member.table)),
                }
            };
            target.mark_evicted(member.tuple, stub);
            lru.on_remove(member.table, member.tuple)?;
            rows.push(EvictedRow {
                table: member.table,
                tuple: member.tuple,
                offset,
            });
        }

        debug!(
            table = %table.id(),
            device = %device,
            block_id,
            tuples = rows.len(),
            bytes = data.len(),
            "Evicted block"
        );
        Ok(BlockSummary {
            device: Some(device),
            block_id: Some(block_id),
            bytes: data.len(),
            rows,
        })
    }
}
