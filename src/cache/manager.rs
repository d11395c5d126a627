//! Anti-cache manager: the per-partition entry point.
//!
//! The manager owns a partition's tables, their LRU chains, the optional
//! frequency sketch and the transaction's evicted-access set, and shares the
//! device registry with other partitions. It is the only component that sees
//! all of them at once, so operations spanning several (eviction rounds,
//! blocking merges, migrations that must rewrite stubs) live here.
//!
//! Typical transaction loop:
//!
//! ```text
//! init_evicted_access_tracker()
//! read_tuple / update_tuple ... -> TouchOutcome::RequiresMerge ?
//! has_blockable_evicted_accesses() ? blocking_merge(), continue
//!                                  : evicted_access_interrupt(), abort,
//!                                    blocking_merge(), retry
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::cache::access::{
    AccessRecord, AccessState, AccessTracker, BlockRef, BlockingPolicy, DeviceFlagPolicy, TouchOutcome,
};
use crate::cache::block::{BlockCodec, BlockId};
use crate::cache::evictor::{BlockSummary, EvictionResult, Evictor, PlannedBlock};
use crate::cache::lru::LruTracker;
use crate::cache::merger::{MergeEngine, MergeResult};
use crate::cache::metrics::AntiCacheMetrics;
use crate::cache::sketch::{tuple_key, FrequencySketch};
use crate::config::{AntiCacheConfig, Config};
use crate::device::registry::{DeviceError, DeviceId, DeviceInfo, DeviceRegistry, MovedBlock, Reservation};
use crate::error::{AntiCacheError, Result};
use crate::table::{Catalog, Table, TableId, Tuple, TupleId, TupleSlot};

pub struct AntiCacheManager {
    config: AntiCacheConfig,
    catalog: Catalog,
    lru: LruTracker,
    sketch: Option<FrequencySketch>,
    access: AccessTracker,
    evictor: Evictor,
    merger: MergeEngine,
    devices: Arc<DeviceRegistry>,
    policy: Box<dyn BlockingPolicy>,
    metrics: AntiCacheMetrics,
    migrate: bool,
    last_eviction: Option<EvictionResult>,
}

impl AntiCacheManager {
    pub fn new(config: &Config, devices: Arc<DeviceRegistry>) -> Result<Self> {
        let ac = config.anticache.clone();
        let codec = BlockCodec::new(ac.compress_blocks, ac.zstd_level);
        let migrate = config.migrate_enabled(devices.len());
        let sketch = config
            .sketch
            .enabled
            .then(|| FrequencySketch::new(&config.sketch));

        info!(
            partition = ac.partition_id,
            devices = devices.len(),
            block_size = ac.block_size,
            chain = ?ac.chain,
            merge_mode = ?ac.merge_mode,
            migrate,
            sketch = sketch.is_some(),
            "Anti-cache initialized"
        );

        Ok(Self {
            catalog: Catalog::new(),
            lru: LruTracker::new(ac.chain),
            sketch,
            access: AccessTracker::new(),
            evictor: Evictor::new(codec.clone()),
            merger: MergeEngine::new(codec, ac.merge_mode),
            metrics: AntiCacheMetrics::new(ac.partition_id)?,
            policy: Box::new(DeviceFlagPolicy),
            devices,
            migrate,
            last_eviction: None,
            config: ac,
        })
    }

    /// Replace the blocking policy.
    pub fn with_policy(mut self, policy: Box<dyn BlockingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &AntiCacheConfig {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table(&self, id: TableId) -> Result<&Table> {
        self.catalog.get(id).ok_or(AntiCacheError::UnknownTable(id))
    }

    fn table_mut(&mut self, id: TableId) -> Result<&mut Table> {
        self.catalog.get_mut(id).ok_or(AntiCacheError::UnknownTable(id))
    }

    pub fn lru(&self) -> &LruTracker {
        &self.lru
    }

    pub fn sketch(&self) -> Option<&FrequencySketch> {
        self.sketch.as_ref()
    }

    /// For window management (`decay`, `reset`).
    pub fn sketch_mut(&mut self) -> Option<&mut FrequencySketch> {
        self.sketch.as_mut()
    }

    pub fn metrics(&self) -> &AntiCacheMetrics {
        &self.metrics
    }

    pub fn access_tracker(&self) -> &AccessTracker {
        &self.access
    }

    pub fn migrate_enabled(&self) -> bool {
        self.migrate
    }

    pub fn set_migrate(&mut self, migrate: bool) {
        self.migrate = migrate;
    }

    /// Result relation of the last `evict_block_to_disk*` call.
    pub fn last_eviction(&self) -> Option<&EvictionResult> {
        self.last_eviction.as_ref()
    }

    // ---- Tables and touch notifications ----

    /// Create a table and its LRU chain.
    pub fn create_table(&mut self, name: impl Into<String>) -> TableId {
        let id = self.catalog.create_table(name);
        self.lru.init_table(id);
        id
    }

    /// Create a table whose tuples reference tuples of `parent`.
    pub fn create_child_table(&mut self, name: impl Into<String>, parent: TableId) -> Result<TableId> {
        self.table(parent)?;
        let id = self.catalog.create_child_table(name, parent);
        self.lru.init_table(id);
        Ok(id)
    }

    pub fn insert_tuple(&mut self, table: TableId, tuple: Tuple) -> Result<TupleId> {
        let id = self.table_mut(table)?.insert(tuple);
        self.lru.on_insert_or_update(table, id, true)?;
        Ok(id)
    }

    /// Notify a read of `tuple`.
    pub fn read_tuple(&mut self, table: TableId, tuple: TupleId) -> Result<TouchOutcome> {
        self.touch(table, tuple, None)
    }

    /// Overwrite a resident tuple's data. An evicted tuple is not modified;
    /// the access is recorded and the caller must merge and retry.
    pub fn update_tuple(&mut self, table: TableId, tuple: TupleId, data: impl Into<Bytes>) -> Result<TouchOutcome> {
        self.touch(table, tuple, Some(data.into()))
    }

    fn touch(&mut self, table: TableId, tuple: TupleId, data: Option<Bytes>) -> Result<TouchOutcome> {
        let resident = match self.table(table)?.slot(tuple) {
            Some(TupleSlot::Resident(_)) => true,
            Some(TupleSlot::Evicted(_)) => false,
            _ => return Err(AntiCacheError::TupleNotFound { table, tuple }),
        };
        if !resident {
            self.record_evicted_access(table, tuple)?;
            return Ok(TouchOutcome::RequiresMerge);
        }

        if let Some(data) = data {
            self.table_mut(table)?.update(tuple, data);
        }
        self.lru.on_insert_or_update(table, tuple, false)?;
        if let Some(sketch) = self.sketch.as_mut() {
            sketch.record(tuple_key(table, tuple));
        }
        Ok(TouchOutcome::Resident)
    }

    /// Re-link a tuple that became resident outside a merge.
    pub fn update_unevicted_tuple(&mut self, table: TableId, tuple: TupleId) -> Result<()> {
        if !self.table(table)?.slot(tuple).is_some_and(TupleSlot::is_resident) {
            return Err(AntiCacheError::TupleNotFound { table, tuple });
        }
        self.lru.on_unevict(table, tuple)
    }

    /// Delete a tuple. Deleting an evicted tuple releases its block offset.
    pub async fn remove_tuple(&mut self, table: TableId, tuple: TupleId) -> Result<()> {
        match self.table_mut(table)?.delete(tuple) {
            Some(TupleSlot::Resident(_)) => {
                self.lru.on_remove(table, tuple)?;
            }
            Some(TupleSlot::Evicted(stub)) => {
                self.devices
                    .release_members(stub.device_id, stub.block_id, &[stub.offset_in_block])
                    .await?;
            }
            _ => return Err(AntiCacheError::TupleNotFound { table, tuple }),
        }
        trace!(table = %table, tuple, "Removed tuple");
        Ok(())
    }

    // ---- Evicted-access protocol ----

    /// Record a dereference of an evicted tuple. Returns false if the tuple
    /// was already recorded in this attempt.
    pub fn record_evicted_access(&mut self, table: TableId, tuple: TupleId) -> Result<bool> {
        let stub = match self.table(table)?.slot(tuple) {
            Some(TupleSlot::Evicted(stub)) => *stub,
            Some(TupleSlot::Resident(_)) => return Err(AntiCacheError::NotEvicted { table, tuple }),
            _ => return Err(AntiCacheError::TupleNotFound { table, tuple }),
        };
        let blockable = self.policy.is_blockable(self.devices.device(stub.device_id)?);
        if let Some(sketch) = self.sketch.as_mut() {
            sketch.record(tuple_key(table, tuple));
        }
        let fresh = self.access.record(table, tuple, stub, blockable);
        if fresh {
            self.metrics.evicted_accesses.inc();
        }
        Ok(fresh)
    }

    pub fn has_evicted_accesses(&self) -> bool {
        self.access.has_evicted_accesses()
    }

    pub fn has_blockable_evicted_accesses(&self) -> bool {
        self.access.has_blockable_evicted_accesses()
    }

    /// Classify the access set (`Blockable` or `MustMerge`).
    pub fn decide(&mut self) -> AccessState {
        self.access.decide()
    }

    /// The retry signal for the current access set, to be returned by the
    /// aborted transaction.
    pub fn evicted_access_interrupt(&mut self) -> AntiCacheError {
        let err = self.access.interrupt();
        debug!(error = %err, "Evicted access interrupt");
        err
    }

    pub fn init_evicted_access_tracker(&mut self) {
        self.access.init();
    }

    /// Fetch every block the access set references, once each, and make the
    /// referenced tuples resident. A no-op when nothing was recorded.
    ///
    /// Once started the merge runs to completion or fails; dropping the
    /// future mid-way is not supported.
    pub async fn blocking_merge(&mut self) -> Result<MergeResult> {
        if !self.access.has_evicted_accesses() {
            return Ok(MergeResult::default());
        }
        let groups = self.access.drain();
        let mut result = MergeResult::default();
        let fetched = match self.merge_fetched(groups, &mut result).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(partition = self.config.partition_id, error = %e, "Blocking merge failed");
                self.merger.clear();
                return Err(e);
            }
        };
        self.metrics.observe_devices(&self.devices);

        info!(
            partition = self.config.partition_id,
            blocks = fetched,
            tuples = result.tuples_merged(),
            released = result.blocks_released,
            "Blocking merge complete"
        );
        Ok(result)
    }

    async fn merge_fetched(
        &mut self,
        groups: BTreeMap<BlockRef, Vec<AccessRecord>>,
        result: &mut MergeResult,
    ) -> Result<usize> {
        let fetched = self.merger.fetch(&self.devices, groups).await?;
        self.metrics.blocks_merged.inc_by(fetched as u64);
        for table in self.merger.pending_tables() {
            result.extend(self.merge_unevicted_tuples(table).await?);
        }
        Ok(fetched)
    }

    /// Restore fetched tuples belonging to `table`.
    pub async fn merge_unevicted_tuples(&mut self, table: TableId) -> Result<MergeResult> {
        let result = self
            .merger
            .merge_unevicted_tuples(table, &mut self.catalog, &mut self.lru, &self.devices)
            .await?;
        self.metrics.tuples_merged.inc_by(result.tuples_merged() as u64);
        Ok(result)
    }

    /// Read one evicted tuple without making it resident.
    pub async fn read_evicted_block(&self, table: TableId, block_id: BlockId, offset: i32) -> Result<Tuple> {
        self.merger
            .read_evicted_block(&self.devices, table, block_id, offset)
            .await
    }

    // ---- Eviction ----

    fn check_child(&self, table: TableId, child: TableId) -> Result<()> {
        self.table(table)?;
        if self.table(child)?.parent() != Some(table) {
            return Err(AntiCacheError::NotChildTable { parent: table, child });
        }
        Ok(())
    }

    /// Report what `evict_block_to_disk` would evict, without writing.
    pub fn evict_block(&self, table: TableId, block_size: usize, num_blocks: usize) -> Result<EvictionResult> {
        let t = self.table(table)?;
        let plan = self
            .evictor
            .plan(t, None, &self.lru, self.sketch.as_ref(), block_size, num_blocks)?;
        Ok(self.evictor.summarize(t, None, &plan))
    }

    /// Dry run of a parent/child batch eviction.
    pub fn evict_block_in_batch(
        &self,
        table: TableId,
        child: TableId,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<EvictionResult> {
        self.check_child(table, child)?;
        let t = self.table(table)?;
        let c = self.table(child)?;
        let plan = self
            .evictor
            .plan(t, Some(c), &self.lru, self.sketch.as_ref(), block_size, num_blocks)?;
        Ok(self.evictor.summarize(t, Some(c), &plan))
    }

    /// Evict up to `num_blocks` blocks of `table` to devices.
    ///
    /// Space for every planned block is reserved before anything is written;
    /// if that fails the round is a no-op and false is returned. The result
    /// relation is kept in [`AntiCacheManager::last_eviction`].
    pub async fn evict_block_to_disk(&mut self, table: TableId, block_size: usize, num_blocks: usize) -> Result<bool> {
        self.evict_to_disk(table, None, block_size, num_blocks).await
    }

    /// Evict parent tuples of `table` together with their children in `child`.
    pub async fn evict_block_to_disk_in_batch(
        &mut self,
        table: TableId,
        child: TableId,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<bool> {
        self.check_child(table, child)?;
        self.evict_to_disk(table, Some(child), block_size, num_blocks).await
    }

    async fn evict_to_disk(
        &mut self,
        table_id: TableId,
        child_id: Option<TableId>,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<bool> {
        let mut result = EvictionResult {
            table: self.table(table_id)?.name().to_string(),
            dry_run: false,
            blocks: Vec::new(),
        };
        let plan = {
            let table = self.table(table_id)?;
            let child = child_id.map(|c| self.table(c)).transpose()?;
            self.evictor
                .plan(table, child, &self.lru, self.sketch.as_ref(), block_size, num_blocks)?
        };

        let mut reservations = Vec::with_capacity(plan.blocks.len());
        for _ in &plan.blocks {
            match self.reserve_db(block_size).await {
                Ok(Some(reservation)) => reservations.push(reservation),
                Ok(None) => {
                    warn!(
                        table = %table_id,
                        block_size,
                        blocks = plan.blocks.len(),
                        "No room for eviction round"
                    );
                    self.release_all(reservations);
                    self.metrics.eviction_failures.inc();
                    self.last_eviction = Some(result);
                    return Ok(false);
                }
                Err(e) => {
                    self.release_all(reservations);
                    return Err(e);
                }
            }
        }

        let mut complete = true;
        let mut reservations = reservations.into_iter();
        for planned in &plan.blocks {
            let Some(reservation) = reservations.next() else {
                break;
            };
            let summary = match self.write_planned(reservation, table_id, child_id, planned).await {
                Ok(summary) => Some(summary),
                Err(AntiCacheError::Device(DeviceError::InsufficientCapacity { device, needed, free })) => {
                    debug!(device = %device, needed, free, "Device rejected block, retrying placement");
                    match self.reserve_db(block_size).await {
                        Ok(Some(retry)) => match self.write_planned(retry, table_id, child_id, planned).await {
                            Ok(summary) => Some(summary),
                            Err(AntiCacheError::Device(DeviceError::InsufficientCapacity { .. })) => None,
                            Err(e) => {
                                self.release_all(reservations);
                                return Err(e);
                            }
                        },
                        Ok(None) => None,
                        Err(e) => {
                            self.release_all(reservations);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.release_all(reservations);
                    return Err(e);
                }
            };
            let Some(summary) = summary else {
                warn!(table = %table_id, block_size, "No device has room for block");
                self.metrics.eviction_failures.inc();
                complete = false;
                break;
            };

            self.metrics.blocks_evicted.inc();
            self.metrics.tuples_evicted.inc_by(summary.rows.len() as u64);
            self.metrics.bytes_evicted.inc_by(summary.bytes as u64);
            result.blocks.push(summary);
        }
        self.release_all(reservations);

        // Hot tuples get their second chance once the round has placed
        // something, or when there was nothing to place.
        if plan.blocks.is_empty() || !result.blocks.is_empty() {
            for &id in &plan.spared {
                self.lru.on_insert_or_update(table_id, id, false)?;
            }
        }
        self.metrics.observe_devices(&self.devices);

        info!(
            table = %result.table,
            blocks = result.blocks_evicted(),
            tuples = result.tuples_evicted(),
            bytes = result.bytes(),
            complete,
            "Eviction round complete"
        );
        self.last_eviction = Some(result);
        Ok(complete)
    }

    /// Write one planned block into `reservation`.
    async fn write_planned(
        &mut self,
        reservation: Reservation,
        table_id: TableId,
        child_id: Option<TableId>,
        planned: &PlannedBlock,
    ) -> Result<BlockSummary> {
        let owner = self.config.partition_id;
        match child_id {
            Some(c) => {
                let Some((table, child)) = self.catalog.get_pair_mut(table_id, c) else {
                    self.devices.release(reservation);
                    return Err(AntiCacheError::UnknownTable(c));
                };
                self.evictor
                    .write(&self.devices, reservation, owner, table, Some(child), &mut self.lru, planned)
                    .await
            }
            None => {
                let Some(table) = self.catalog.get_mut(table_id) else {
                    self.devices.release(reservation);
                    return Err(AntiCacheError::UnknownTable(table_id));
                };
                self.evictor
                    .write(&self.devices, reservation, owner, table, None, &mut self.lru, planned)
                    .await
            }
        }
    }

    fn release_all(&self, reservations: impl IntoIterator<Item = Reservation>) {
        for reservation in reservations {
            self.devices.release(reservation);
        }
    }

    // ---- Devices ----

    pub fn get_anticache_db(&self, id: u16) -> Option<DeviceInfo> {
        self.devices.get(id).map(|d| d.info())
    }

    pub fn num_anticache_dbs(&self) -> usize {
        self.devices.len()
    }

    /// Pick a device with `block_size` bytes free, round-robin. With
    /// `migrate`, if none qualifies the least recently used block of the
    /// fullest device is moved to the device with the most free space and
    /// selection is retried once.
    pub async fn choose_db(&mut self, block_size: usize, migrate: bool) -> Result<Option<DeviceId>> {
        let needed = block_size as u64;
        if let Some(device) = self.devices.choose_device(needed) {
            return Ok(Some(device));
        }
        if !migrate || !self.relieve_pressure().await? {
            return Ok(None);
        }
        Ok(self.devices.choose_device(needed))
    }

    /// [`AntiCacheManager::choose_db`] that holds the space until the block
    /// is written or the reservation released.
    async fn reserve_db(&mut self, block_size: usize) -> Result<Option<Reservation>> {
        let needed = block_size as u64;
        if let Some(reservation) = self.devices.reserve(needed) {
            return Ok(Some(reservation));
        }
        if !self.migrate || !self.relieve_pressure().await? {
            return Ok(None);
        }
        Ok(self.devices.reserve(needed))
    }

    /// Move the LRU block of the fullest device to the emptiest one.
    /// Returns whether a block moved.
    async fn relieve_pressure(&mut self) -> Result<bool> {
        let Some(src) = self.devices.fullest() else {
            return Ok(false);
        };
        let Some(dst) = self.devices.most_free(Some(src)) else {
            return Ok(false);
        };
        match self.migrate_lru_block(src, dst).await {
            Ok(moved) => Ok(moved.is_some()),
            Err(AntiCacheError::Device(DeviceError::InsufficientCapacity { device, needed, free })) => {
                debug!(device = %device, needed, free, "Migration target is full");
                Ok(false)
            }
            Err(AntiCacheError::BlockInUse { block_id }) => {
                debug!(block_id, "LRU block awaits merge, not migrating");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Move a block owned by this partition to `dst` and retarget every stub
    /// that references it. Blocks the running transaction has accessed stay
    /// put until they are merged.
    pub async fn migrate_block(&mut self, block_id: BlockId, dst: DeviceId) -> Result<MovedBlock> {
        if self.access.references_block(block_id) {
            return Err(AntiCacheError::BlockInUse { block_id });
        }
        let moved = self
            .devices
            .move_block(block_id, dst, self.config.partition_id)
            .await?;
        if moved.src == moved.dst {
            return Ok(moved);
        }

        for member in &moved.members {
            let table = self.table_mut(member.table)?;
            if !table.retarget_stub(member.tuple, moved.dst) {
                warn!(table = %member.table, tuple = member.tuple, block_id, "Migrated member has no stub");
            }
        }
        self.metrics.blocks_migrated.inc();
        self.metrics.observe_devices(&self.devices);

        info!(
            block_id,
            from = %moved.src,
            to = %moved.dst,
            size = moved.size,
            tuples = moved.members.len(),
            "Migrated block"
        );
        Ok(moved)
    }

    /// Migrate the least recently accessed block of this partition from
    /// `src` to `dst`. Returns `None` if `src` holds no such block.
    pub async fn migrate_lru_block(&mut self, src: DeviceId, dst: DeviceId) -> Result<Option<MovedBlock>> {
        let Some(block_id) = self.devices.lru_block(src, self.config.partition_id).await? else {
            return Ok(None);
        };
        self.migrate_block(block_id, dst).await.map(Some)
    }

    /// Check a table's residency invariants: the chain holds exactly the
    /// resident tuples in recency order, and every stub references a live
    /// member of a block on the device it names.
    pub async fn check_invariants(&self, table: TableId) -> std::result::Result<(), String> {
        let t = self.table(table).map_err(|e| e.to_string())?;
        self.lru.validate(t)?;

        for id in t.evicted_ids() {
            let Some(stub) = t.slot(id).and_then(TupleSlot::stub) else {
                continue;
            };
            let members = self
                .devices
                .block_members(stub.device_id, stub.block_id)
                .await
                .map_err(|e| format!("tuple {id}: {e}"))?;
            match members.get(stub.offset_in_block as usize) {
                Some(Some(m)) if m.table == table && m.tuple == id => {}
                other => {
                    return Err(format!(
                        "tuple {id} stub {}:{}:{} resolves to {other:?}",
                        stub.device_id, stub.block_id, stub.offset_in_block
                    ))
                }
            }
        }
        Ok(())
    }
}
