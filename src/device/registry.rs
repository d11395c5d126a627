//! Device registry: numbered anti-cache devices with capacity accounting,
//! placement and block migration.
//!
//! Devices may be shared by several partitions, so every operation touching a
//! device's block bookkeeping takes that device's lock: writes, removals and
//! migrations take it exclusively; reads take it shared, so concurrent fetches
//! proceed together but never overlap a migration of the same device.
//! Migrations lock both devices in ascending id order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::cache::block::BlockId;
use crate::config::{BackendConfig, DeviceConfig, MAX_DEVICES};
use crate::device::disk::DiskStore;
use crate::device::store::{BlockStore, MemoryStore, StoreError};
use crate::table::{TableId, TupleId};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device table full: at most {max} devices can be registered")]
    TooManyDevices { max: usize },

    #[error("Device {0} is not registered")]
    UnknownDevice(u16),

    #[error("Block {block_id} not found on device {device}")]
    UnknownBlock { device: DeviceId, block_id: BlockId },

    #[error("Device {device} has {free} bytes free, {needed} needed")]
    InsufficientCapacity {
        device: DeviceId,
        needed: u64,
        free: u64,
    },

    #[error("Device {device} I/O failed: {source}")]
    Store {
        device: DeviceId,
        #[source]
        source: StoreError,
    },
}

/// Checked handle to a registered device. Only the registry mints these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(u16);

impl DeviceId {
    pub(crate) fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tuple stored in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockMember {
    pub table: TableId,
    pub tuple: TupleId,
}

/// What the writer tells the registry about a new block.
#[derive(Debug, Clone)]
pub struct NewBlock {
    /// Partition whose tables hold the block's stubs.
    pub owner: u32,
    /// Members by offset.
    pub members: Vec<BlockMember>,
    /// Parent/child batch block.
    pub batched: bool,
}

/// Bookkeeping for one block on a device.
#[derive(Debug)]
struct BlockMeta {
    size: u64,
    owner: u32,
    batched: bool,
    /// Members by offset; `None` once merged.
    members: Vec<Option<BlockMember>>,
    live: usize,
    last_access: AtomicU64,
}

#[derive(Debug, Default)]
struct DeviceState {
    blocks: HashMap<BlockId, BlockMeta>,
}

/// One registered anti-cache device.
pub struct Device {
    id: DeviceId,
    name: String,
    capacity: u64,
    blockable: bool,
    /// Bytes held; only changed under the exclusive lock.
    used: AtomicU64,
    /// Bytes promised to blocks not yet written.
    reserved: AtomicU64,
    block_count: AtomicUsize,
    store: Box<dyn BlockStore>,
    state: RwLock<DeviceState>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Capacity not held by blocks or reservations.
    pub fn free(&self) -> u64 {
        self.capacity
            .saturating_sub(self.used())
            .saturating_sub(self.reserved())
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                let free = self.capacity.saturating_sub(self.used()).saturating_sub(held);
                (free >= bytes).then_some(held + bytes)
            })
            .is_ok()
    }

    pub fn blockable(&self) -> bool {
        self.blockable
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.store.kind().to_string(),
            capacity: self.capacity,
            used: self.used(),
            reserved: self.reserved(),
            blocks: self.block_count.load(Ordering::Acquire),
            blockable: self.blockable,
        }
    }

    fn store_err(&self, source: StoreError) -> DeviceError {
        DeviceError::Store {
            device: self.id,
            source,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("blockable", &self.blockable)
            .finish()
    }
}

/// Point-in-time view of a device for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub kind: String,
    pub capacity: u64,
    pub used: u64,
    pub reserved: u64,
    pub blocks: usize,
    pub blockable: bool,
}

/// Space set aside on a device for one block that is about to be written.
///
/// Minted by [`DeviceRegistry::reserve`] and consumed by
/// [`DeviceRegistry::write_reserved`] or [`DeviceRegistry::release`].
#[derive(Debug)]
#[must_use = "a reservation holds device space until written or released"]
pub struct Reservation {
    device: DeviceId,
    bytes: u64,
}

impl Reservation {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Result of moving a block between devices.
#[derive(Debug, Clone)]
pub struct MovedBlock {
    pub block_id: BlockId,
    pub src: DeviceId,
    pub dst: DeviceId,
    pub size: u64,
    /// Members still evicted in the block; their stubs must be retargeted.
    pub members: Vec<BlockMember>,
}

/// Fixed-capacity table of devices indexed by id.
pub struct DeviceRegistry {
    devices: [Option<Device>; MAX_DEVICES],
    num_devices: usize,
    next_block_id: AtomicI32,
    /// Round-robin placement cursor.
    cursor: AtomicUsize,
    /// Logical clock for block access recency.
    clock: AtomicU64,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: std::array::from_fn(|_| None),
            num_devices: 0,
            next_block_id: AtomicI32::new(0),
            cursor: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Build a registry from configuration, opening each backend.
    pub async fn from_config(devices: &[DeviceConfig]) -> Result<Self, DeviceError> {
        let mut registry = Self::new();
        for cfg in devices {
            let id = DeviceId::new(registry.num_devices as u16);
            let store: Box<dyn BlockStore> = match &cfg.backend {
                BackendConfig::Memory => Box::new(MemoryStore::new()),
                BackendConfig::Disk { path } => Box::new(
                    DiskStore::open(path.clone())
                        .await
                        .map_err(|source| DeviceError::Store { device: id, source })?,
                ),
            };
            registry.add_device(cfg.name.clone(), cfg.capacity, cfg.blockable, store)?;
        }
        Ok(registry)
    }

    /// Register a backend under the next free id.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        capacity: u64,
        blockable: bool,
        store: Box<dyn BlockStore>,
    ) -> Result<DeviceId, DeviceError> {
        if self.num_devices >= MAX_DEVICES {
            warn!(max = MAX_DEVICES, "Rejecting device registration");
            return Err(DeviceError::TooManyDevices { max: MAX_DEVICES });
        }
        let id = DeviceId::new(self.num_devices as u16);
        let name = name.into();
        info!(
            device = %id,
            name = %name,
            kind = store.kind(),
            capacity,
            blockable,
            "Registered anti-cache device"
        );
        self.devices[self.num_devices] = Some(Device {
            id,
            name,
            capacity,
            blockable,
            used: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            block_count: AtomicUsize::new(0),
            store,
            state: RwLock::new(DeviceState::default()),
        });
        self.num_devices += 1;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.num_devices
    }

    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device, DeviceError> {
        self.devices
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::UnknownDevice(id.0))
    }

    /// Look up a device by raw id, as operational tooling does.
    pub fn get(&self, raw_id: u16) -> Option<&Device> {
        self.devices.get(raw_id as usize).and_then(Option::as_ref)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    /// Round-robin walk from the cursor; the first device `accept` takes
    /// becomes the pick.
    fn round_robin(&self, mut accept: impl FnMut(&Device) -> bool) -> Option<DeviceId> {
        let n = self.num_devices;
        if n == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % n;
        for step in 0..n {
            let idx = (start + step) % n;
            if let Some(dev) = &self.devices[idx] {
                if accept(dev) {
                    self.cursor.store(idx + 1, Ordering::Relaxed);
                    return Some(dev.id);
                }
            }
        }
        None
    }

    /// Pick a device with at least `block_size` bytes free, round-robin.
    pub fn choose_device(&self, block_size: u64) -> Option<DeviceId> {
        self.round_robin(|dev| dev.free() >= block_size)
    }

    /// Like [`DeviceRegistry::choose_device`], but the space is held until
    /// the reservation is written or released, so no other writer or
    /// migration can take it in between.
    pub fn reserve(&self, block_size: u64) -> Option<Reservation> {
        let device = self.round_robin(|dev| dev.try_reserve(block_size))?;
        trace!(device = %device, bytes = block_size, "Reserved block space");
        Some(Reservation {
            device,
            bytes: block_size,
        })
    }

    /// Hand back unused reserved space.
    pub fn release(&self, reservation: Reservation) {
        if let Ok(dev) = self.device(reservation.device) {
            dev.reserved.fetch_sub(reservation.bytes, Ordering::AcqRel);
        }
    }

    /// Device with the least free space.
    pub fn fullest(&self) -> Option<DeviceId> {
        self.devices()
            .min_by_key(|d| (d.free(), d.id))
            .map(|d| d.id)
    }

    /// Device with the most free space, other than `exclude`.
    pub fn most_free(&self, exclude: Option<DeviceId>) -> Option<DeviceId> {
        self.devices()
            .filter(|d| Some(d.id) != exclude)
            .max_by_key(|d| (d.free(), std::cmp::Reverse(d.id)))
            .map(|d| d.id)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write an encoded block to `device`, allocating its id.
    pub async fn write_block(
        &self,
        device: DeviceId,
        data: &[u8],
        block: NewBlock,
    ) -> Result<BlockId, DeviceError> {
        self.write_inner(device, data, block, 0).await
    }

    /// Write a block into reserved space. The reservation is consumed
    /// whether or not the write succeeds.
    pub async fn write_reserved(
        &self,
        reservation: Reservation,
        data: &[u8],
        block: NewBlock,
    ) -> Result<BlockId, DeviceError> {
        let result = self
            .write_inner(reservation.device, data, block, reservation.bytes)
            .await;
        self.release(reservation);
        result
    }

    /// `held` bytes of the device's reservations belong to this write.
    async fn write_inner(
        &self,
        device: DeviceId,
        data: &[u8],
        block: NewBlock,
        held: u64,
    ) -> Result<BlockId, DeviceError> {
        let dev = self.device(device)?;
        let mut state = dev.state.write().await;

        let needed = data.len() as u64;
        let available = dev.free() + held;
        if available < needed {
            return Err(DeviceError::InsufficientCapacity {
                device,
                needed,
                free: available,
            });
        }

        let block_id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        dev.store
            .write_block(block_id, data)
            .await
            .map_err(|e| dev.store_err(e))?;

        let live = block.members.len();
        let batched = block.batched;
        state.blocks.insert(
            block_id,
            BlockMeta {
                size: needed,
                owner: block.owner,
                batched,
                members: block.members.into_iter().map(Some).collect(),
                live,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        dev.used.fetch_add(needed, Ordering::AcqRel);
        dev.block_count.fetch_add(1, Ordering::AcqRel);

        debug!(
            device = %device,
            block_id,
            size = needed,
            tuples = live,
            batched,
            "Wrote block"
        );
        Ok(block_id)
    }

    /// Fetch a block's bytes. Records the access for LRU-block selection.
    pub async fn read_block(&self, device: DeviceId, block_id: BlockId) -> Result<Vec<u8>, DeviceError> {
        let dev = self.device(device)?;
        let state = dev.state.read().await;
        let meta = state
            .blocks
            .get(&block_id)
            .ok_or(DeviceError::UnknownBlock { device, block_id })?;
        meta.last_access.store(self.tick(), Ordering::Relaxed);

        dev.store
            .read_block(block_id)
            .await
            .map_err(|e| dev.store_err(e))
    }

    /// Members of a block by offset; merged offsets are `None`.
    pub async fn block_members(
        &self,
        device: DeviceId,
        block_id: BlockId,
    ) -> Result<Vec<Option<BlockMember>>, DeviceError> {
        let dev = self.device(device)?;
        let state = dev.state.read().await;
        state
            .blocks
            .get(&block_id)
            .map(|m| m.members.clone())
            .ok_or(DeviceError::UnknownBlock { device, block_id })
    }

    /// Mark offsets of a block as merged. When no member remains the block is
    /// deleted from the device and its space released. Returns whether the
    /// block was deleted.
    pub async fn release_members(
        &self,
        device: DeviceId,
        block_id: BlockId,
        offsets: &[i32],
    ) -> Result<bool, DeviceError> {
        let dev = self.device(device)?;
        let mut state = dev.state.write().await;
        let meta = state
            .blocks
            .get_mut(&block_id)
            .ok_or(DeviceError::UnknownBlock { device, block_id })?;

        for &offset in offsets {
            if let Some(member) = meta.members.get_mut(offset as usize) {
                if member.take().is_some() {
                    meta.live -= 1;
                }
            }
        }
        if meta.live > 0 {
            return Ok(false);
        }

        let size = meta.size;
        dev.store
            .remove_block(block_id)
            .await
            .map_err(|e| dev.store_err(e))?;
        state.blocks.remove(&block_id);
        dev.used.fetch_sub(size, Ordering::AcqRel);
        dev.block_count.fetch_sub(1, Ordering::AcqRel);
        debug!(device = %device, block_id, size, "Released block");
        Ok(true)
    }

    /// Device currently holding `block_id`.
    pub async fn locate(&self, block_id: BlockId) -> Option<DeviceId> {
        for dev in self.devices() {
            if dev.state.read().await.blocks.contains_key(&block_id) {
                return Some(dev.id);
            }
        }
        None
    }

    /// Least recently accessed block on `device` owned by partition `owner`.
    pub async fn lru_block(&self, device: DeviceId, owner: u32) -> Result<Option<BlockId>, DeviceError> {
        let dev = self.device(device)?;
        let state = dev.state.read().await;
        Ok(state
            .blocks
            .iter()
            .filter(|(_, m)| m.owner == owner)
            .min_by_key(|(id, m)| (m.last_access.load(Ordering::Relaxed), **id))
            .map(|(id, _)| *id))
    }

    /// Move a block to `dst`, keeping its id and offsets.
    ///
    /// The block is written to `dst` before it is deleted from its source; if
    /// the deletion fails the copy on `dst` is discarded, so a failed move
    /// leaves the original block intact and nothing registered on `dst`.
    /// Only blocks owned by partition `owner` can be moved, since only that
    /// partition can retarget their stubs.
    pub async fn move_block(
        &self,
        block_id: BlockId,
        dst: DeviceId,
        owner: u32,
    ) -> Result<MovedBlock, DeviceError> {
        let src = self
            .locate(block_id)
            .await
            .ok_or(DeviceError::UnknownBlock { device: dst, block_id })?;
        let src_dev = self.device(src)?;
        let dst_dev = self.device(dst)?;

        if src == dst {
            let state = src_dev.state.read().await;
            let meta = state
                .blocks
                .get(&block_id)
                .filter(|m| m.owner == owner)
                .ok_or(DeviceError::UnknownBlock { device: src, block_id })?;
            return Ok(MovedBlock {
                block_id,
                src,
                dst,
                size: meta.size,
                members: meta.members.iter().flatten().copied().collect(),
            });
        }

        let (mut src_state, mut dst_state) = if src < dst {
            let s = src_dev.state.write().await;
            let d = dst_dev.state.write().await;
            (s, d)
        } else {
            let d = dst_dev.state.write().await;
            let s = src_dev.state.write().await;
            (s, d)
        };

        let size = src_state
            .blocks
            .get(&block_id)
            .filter(|m| m.owner == owner)
            .map(|m| m.size)
            .ok_or(DeviceError::UnknownBlock { device: src, block_id })?;
        if dst_dev.free() < size {
            return Err(DeviceError::InsufficientCapacity {
                device: dst,
                needed: size,
                free: dst_dev.free(),
            });
        }

        let data = src_dev
            .store
            .read_block(block_id)
            .await
            .map_err(|e| src_dev.store_err(e))?;
        dst_dev
            .store
            .write_block(block_id, &data)
            .await
            .map_err(|e| dst_dev.store_err(e))?;

        if let Err(e) = src_dev.store.remove_block(block_id).await {
            if let Err(cleanup) = dst_dev.store.remove_block(block_id).await {
                warn!(device = %dst, block_id, error = %cleanup, "Failed to discard migrated copy");
            }
            return Err(src_dev.store_err(e));
        }

        let Some(meta) = src_state.blocks.remove(&block_id) else {
            return Err(DeviceError::UnknownBlock { device: src, block_id });
        };
        src_dev.used.fetch_sub(size, Ordering::AcqRel);
        src_dev.block_count.fetch_sub(1, Ordering::AcqRel);

        let members = meta.members.iter().flatten().copied().collect();
        let batched = meta.batched;
        dst_state.blocks.insert(block_id, meta);
        dst_dev.used.fetch_add(size, Ordering::AcqRel);
        dst_dev.block_count.fetch_add(1, Ordering::AcqRel);

        debug!(block_id, from = %src, to = %dst, size, batched, "Moved block");
        Ok(MovedBlock {
            block_id,
            src,
            dst,
            size,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_registry(capacities: &[u64]) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for (i, &cap) in capacities.iter().enumerate() {
            registry
                .add_device(format!("mem{i}"), cap, true, Box::new(MemoryStore::new()))
                .unwrap();
        }
        registry
    }

    fn new_block(n: u32) -> NewBlock {
        NewBlock {
            owner: 0,
            members: (0..n)
                .map(|tuple| BlockMember {
                    table: TableId(0),
                    tuple,
                })
                .collect(),
            batched: false,
        }
    }

    #[test]
    fn test_device_table_full() {
        let mut registry = mem_registry(&[1; MAX_DEVICES]);
        assert_eq!(registry.len(), MAX_DEVICES);
        let err = registry
            .add_device("extra", 1, true, Box::new(MemoryStore::new()))
            .unwrap_err();
        assert!(matches!(err, DeviceError::TooManyDevices { max: 8 }));
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn test_choose_round_robin() {
        let registry = mem_registry(&[1000, 1000, 10]);
        let picks: Vec<u16> = (0..4)
            .map(|_| registry.choose_device(100).unwrap().get())
            .collect();
        // Device 2 lacks headroom and is skipped.
        assert_eq!(picks, vec![0, 1, 0, 1]);
        assert!(registry.choose_device(5000).is_none());
    }

    #[tokio::test]
    async fn test_write_read_release() {
        let registry = mem_registry(&[1000]);
        let dev = DeviceId::new(0);
        let id = registry.write_block(dev, &[9u8; 100], new_block(2)).await.unwrap();
        assert_eq!(registry.device(dev).unwrap().used(), 100);
        assert_eq!(registry.read_block(dev, id).await.unwrap(), vec![9u8; 100]);

        assert!(!registry.release_members(dev, id, &[0]).await.unwrap());
        assert_eq!(registry.device(dev).unwrap().used(), 100);
        assert!(registry.release_members(dev, id, &[1]).await.unwrap());
        assert_eq!(registry.device(dev).unwrap().used(), 0);
        assert!(registry.read_block(dev, id).await.is_err());
    }

    #[tokio::test]
    async fn test_write_rejects_over_capacity() {
        let registry = mem_registry(&[50]);
        let err = registry
            .write_block(DeviceId::new(0), &[0u8; 100], new_block(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::InsufficientCapacity { needed: 100, .. }));
    }

    #[tokio::test]
    async fn test_move_block() {
        let registry = mem_registry(&[1000, 1000]);
        let (a, b) = (DeviceId::new(0), DeviceId::new(1));
        let id = registry.write_block(a, &[3u8; 200], new_block(3)).await.unwrap();
        registry.release_members(a, id, &[1]).await.unwrap();

        assert!(registry.move_block(id, b, 9).await.is_err());
        let moved = registry.move_block(id, b, 0).await.unwrap();
        assert_eq!(moved.src, a);
        assert_eq!(moved.members.len(), 2);
        assert_eq!(registry.device(a).unwrap().used(), 0);
        assert_eq!(registry.device(b).unwrap().used(), 200);
        assert_eq!(registry.locate(id).await, Some(b));
        assert_eq!(registry.read_block(b, id).await.unwrap(), vec![3u8; 200]);
        assert!(registry.read_block(a, id).await.is_err());
    }

    #[tokio::test]
    async fn test_reservations_hold_space() {
        let registry = mem_registry(&[1000]);
        let dev = DeviceId::new(0);

        let held = registry.reserve(600).unwrap();
        assert_eq!(held.device(), dev);
        assert_eq!(registry.device(dev).unwrap().free(), 400);
        assert!(registry.reserve(600).is_none());
        assert!(registry.choose_device(600).is_none());
        assert!(registry.write_block(dev, &[0u8; 500], new_block(1)).await.is_err());

        // The holder can still use its own space.
        let id = registry.write_reserved(held, &[1u8; 550], new_block(1)).await.unwrap();
        let device = registry.device(dev).unwrap();
        assert_eq!((device.used(), device.reserved(), device.free()), (550, 0, 450));
        assert_eq!(registry.read_block(dev, id).await.unwrap(), vec![1u8; 550]);

        let spare = registry.reserve(400).unwrap();
        registry.release(spare);
        assert_eq!(registry.device(dev).unwrap().free(), 450);
    }

    #[tokio::test]
    async fn test_failed_reserved_write_returns_space() {
        let registry = mem_registry(&[1000]);
        let held = registry.reserve(100).unwrap();
        let err = registry
            .write_reserved(held, &[0u8; 1200], new_block(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::InsufficientCapacity { needed: 1200, free: 1000, .. }));
        let device = registry.device(DeviceId::new(0)).unwrap();
        assert_eq!((device.used(), device.reserved()), (0, 0));
    }

    #[tokio::test]
    async fn test_move_respects_reservations() {
        let registry = mem_registry(&[300, 1000]);
        let (a, b) = (DeviceId::new(0), DeviceId::new(1));
        let id = registry.write_block(b, &[3u8; 200], new_block(1)).await.unwrap();

        let held = registry.reserve(150).unwrap();
        assert_eq!(held.device(), a);
        assert!(matches!(
            registry.move_block(id, a, 0).await,
            Err(DeviceError::InsufficientCapacity { free: 150, .. })
        ));
        assert_eq!(registry.locate(id).await, Some(b));

        registry.release(held);
        registry.move_block(id, a, 0).await.unwrap();
        assert_eq!(registry.device(a).unwrap().used(), 200);
    }

    #[tokio::test]
    async fn test_lru_block() {
        let registry = mem_registry(&[1000]);
        let dev = DeviceId::new(0);
        let first = registry.write_block(dev, &[0u8; 10], new_block(1)).await.unwrap();
        let second = registry.write_block(dev, &[0u8; 10], new_block(1)).await.unwrap();
        assert_eq!(registry.lru_block(dev, 0).await.unwrap(), Some(first));

        registry.read_block(dev, first).await.unwrap();
        assert_eq!(registry.lru_block(dev, 0).await.unwrap(), Some(second));
        assert_eq!(registry.lru_block(dev, 7).await.unwrap(), None);
    }
}
