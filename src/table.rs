//! Minimal in-memory table used as the anti-cache's storage collaborator.
//!
//! A table is an arena of fixed tuple slots addressed by a dense [`TupleId`].
//! Each slot is either resident (holds the tuple's bytes), evicted (holds an
//! [`EvictedStub`] pointing at a block on a device), or empty (deleted).
//! The anti-cache never owns tuple data while it is resident; it only moves
//! bytes between a slot and a block.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::block::BlockId;
use crate::device::registry::DeviceId;

/// Identifies a table within a [`Catalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Dense slot index of a tuple within its table.
pub type TupleId = u32;

/// Per-tuple serialization overhead counted against the block budget
/// (table and tuple ids, parent reference and length prefix).
pub const TUPLE_HEADER_BYTES: usize = 24;

/// A resident tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    /// Parent tuple in the owning table's parent table, if any.
    pub parent: Option<TupleId>,

    /// Column data.
    pub data: Bytes,
}

impl Tuple {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            parent: None,
            data: data.into(),
        }
    }

    /// A child row referencing `parent` in the parent table.
    pub fn with_parent(parent: TupleId, data: impl Into<Bytes>) -> Self {
        Self {
            parent: Some(parent),
            data: data.into(),
        }
    }

    /// Bytes this tuple occupies inside a block.
    pub fn serialized_size(&self) -> usize {
        self.data.len() + TUPLE_HEADER_BYTES
    }
}

/// Placeholder left in a slot whose tuple was written to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EvictedStub {
    pub device_id: DeviceId,
    pub block_id: BlockId,
    pub offset_in_block: i32,
}

/// State of one tuple slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleSlot {
    Resident(Tuple),
    Evicted(EvictedStub),
    Empty,
}

impl TupleSlot {
    pub fn is_resident(&self) -> bool {
        matches!(self, TupleSlot::Resident(_))
    }

    pub fn stub(&self) -> Option<EvictedStub> {
        match self {
            TupleSlot::Evicted(stub) => Some(*stub),
            _ => None,
        }
    }
}

/// A persistent in-memory table.
#[derive(Debug)]
pub struct Table {
    id: TableId,
    name: String,
    /// Table whose tuple ids this table's `Tuple::parent` refers to.
    parent: Option<TableId>,
    slots: Vec<TupleSlot>,
}

impl Table {
    pub fn new(id: TableId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            slots: Vec::new(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<TableId> {
        self.parent
    }

    /// Append a tuple, returning its slot id.
    pub fn insert(&mut self, tuple: Tuple) -> TupleId {
        let id = self.slots.len() as TupleId;
        self.slots.push(TupleSlot::Resident(tuple));
        id
    }

    pub fn slot(&self, id: TupleId) -> Option<&TupleSlot> {
        self.slots.get(id as usize)
    }

    /// The resident tuple at `id`, if any.
    pub fn tuple(&self, id: TupleId) -> Option<&Tuple> {
        match self.slots.get(id as usize) {
            Some(TupleSlot::Resident(t)) => Some(t),
            _ => None,
        }
    }

    /// Replace a resident tuple's data. Returns false if the slot is not resident.
    pub fn update(&mut self, id: TupleId, data: impl Into<Bytes>) -> bool {
        match self.slots.get_mut(id as usize) {
            Some(TupleSlot::Resident(t)) => {
                t.data = data.into();
                true
            }
            _ => false,
        }
    }

    /// Clear a slot, returning what it held.
    pub fn delete(&mut self, id: TupleId) -> Option<TupleSlot> {
        let slot = self.slots.get_mut(id as usize)?;
        match slot {
            TupleSlot::Empty => None,
            _ => Some(std::mem::replace(slot, TupleSlot::Empty)),
        }
    }

    /// Swap a resident tuple out for a stub, returning the tuple.
    pub(crate) fn mark_evicted(&mut self, id: TupleId, stub: EvictedStub) -> Option<Tuple> {
        let slot = self.slots.get_mut(id as usize)?;
        if !slot.is_resident() {
            return None;
        }
        match std::mem::replace(slot, TupleSlot::Evicted(stub)) {
            TupleSlot::Resident(t) => Some(t),
            _ => None,
        }
    }

    /// Put a tuple back into the slot its stub occupies.
    pub(crate) fn restore(&mut self, id: TupleId, tuple: Tuple) -> bool {
        match self.slots.get_mut(id as usize) {
            Some(slot) if matches!(slot, TupleSlot::Evicted(_)) => {
                *slot = TupleSlot::Resident(tuple);
                true
            }
            _ => false,
        }
    }

    /// Point an existing stub at a different device.
    pub(crate) fn retarget_stub(&mut self, id: TupleId, device_id: DeviceId) -> bool {
        match self.slots.get_mut(id as usize) {
            Some(TupleSlot::Evicted(stub)) => {
                stub.device_id = device_id;
                true
            }
            _ => false,
        }
    }

    pub fn resident_ids(&self) -> Vec<TupleId> {
        self.ids_where(TupleSlot::is_resident)
    }

    pub fn evicted_ids(&self) -> Vec<TupleId> {
        self.ids_where(|s| matches!(s, TupleSlot::Evicted(_)))
    }

    /// Number of live rows, resident or evicted.
    pub fn row_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, TupleSlot::Empty))
            .count()
    }

    pub fn evicted_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, TupleSlot::Evicted(_)))
            .count()
    }

    fn ids_where(&self, pred: impl Fn(&TupleSlot) -> bool) -> Vec<TupleId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| pred(s))
            .map(|(i, _)| i as TupleId)
            .collect()
    }
}

/// The set of tables owned by one partition.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: Vec<Table>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table and return its id.
    pub fn create_table(&mut self, name: impl Into<String>) -> TableId {
        let id = TableId(self.tables.len() as u32);
        self.tables.push(Table::new(id, name));
        id
    }

    /// Create a table whose tuples reference rows of `parent`.
    pub fn create_child_table(&mut self, name: impl Into<String>, parent: TableId) -> TableId {
        let id = self.create_table(name);
        if let Some(table) = self.tables.last_mut() {
            table.parent = Some(parent);
        }
        id
    }

    pub fn get(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id.0 as usize)
    }

    /// Borrow two distinct tables mutably.
    pub fn get_pair_mut(&mut self, a: TableId, b: TableId) -> Option<(&mut Table, &mut Table)> {
        let (a, b) = (a.0 as usize, b.0 as usize);
        if a == b || a >= self.tables.len() || b >= self.tables.len() {
            return None;
        }
        if a < b {
            let (lo, hi) = self.tables.split_at_mut(b);
            Some((&mut lo[a], &mut hi[0]))
        } else {
            let (lo, hi) = self.tables.split_at_mut(a);
            Some((&mut hi[0], &mut lo[b]))
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_update_delete() {
        let mut table = Table::new(TableId(0), "accounts");
        let a = table.insert(Tuple::new(vec![1u8; 8]));
        let b = table.insert(Tuple::new(vec![2u8; 8]));
        assert_eq!((a, b), (0, 1));

        assert!(table.update(a, vec![9u8; 4]));
        assert_eq!(table.tuple(a).unwrap().data.as_ref(), &[9u8; 4]);

        assert!(table.delete(b).is_some());
        assert!(table.delete(b).is_none());
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn test_evict_and_restore_slot() {
        let mut table = Table::new(TableId(0), "accounts");
        let id = table.insert(Tuple::new(vec![7u8; 32]));
        let stub = EvictedStub {
            device_id: DeviceId::new(0),
            block_id: 3,
            offset_in_block: 0,
        };

        let tuple = table.mark_evicted(id, stub).unwrap();
        assert_eq!(table.slot(id).unwrap().stub(), Some(stub));
        assert!(!table.update(id, vec![0u8]));
        assert_eq!(table.evicted_ids(), vec![id]);

        assert!(table.restore(id, tuple));
        assert!(table.slot(id).unwrap().is_resident());
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn test_child_table_links() {
        let mut catalog = Catalog::new();
        let parent = catalog.create_table("customers");
        let child = catalog.create_child_table("orders", parent);

        let (p, c) = catalog.get_pair_mut(parent, child).unwrap();
        let cust = p.insert(Tuple::new(vec![1u8]));
        c.insert(Tuple::with_parent(cust, vec![2u8]));
        c.insert(Tuple::with_parent(cust + 1, vec![3u8]));
        c.insert(Tuple::with_parent(cust, vec![4u8]));

        let kids: Vec<TupleId> = c
            .resident_ids()
            .into_iter()
            .filter(|&id| c.tuple(id).and_then(|t| t.parent) == Some(cust))
            .collect();
        assert_eq!(kids, vec![0, 2]);
        assert_eq!(c.parent(), Some(parent));
        assert!(catalog.get_pair_mut(parent, parent).is_none());
    }
}
