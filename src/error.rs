//! Engine-level error type.

use thiserror::Error;

use crate::cache::access::EvictedAccessInterrupt;
use crate::cache::block::{BlockId, CodecError};
use crate::device::registry::{DeviceError, DeviceId};
use crate::table::{TableId, TupleId};

pub type Result<T> = std::result::Result<T, AntiCacheError>;

#[derive(Error, Debug)]
pub enum AntiCacheError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Unknown table {0}")]
    UnknownTable(TableId),

    #[error("Tuple {tuple} not found in table {table}")]
    TupleNotFound { table: TableId, tuple: TupleId },

    #[error("Table {child} is not a child of table {parent}")]
    NotChildTable { parent: TableId, child: TableId },

    #[error("No LRU chain initialized for table {0}")]
    ChainNotInitialized(TableId),

    #[error("Tuple {tuple} in table {table} is not evicted")]
    NotEvicted { table: TableId, tuple: TupleId },

    /// Retry signal: the transaction touched evicted data and must be
    /// re-run after the recorded blocks are merged.
    #[error("Transaction touched {} evicted block(s); merge and retry", .0.blocks.len())]
    EvictedAccess(EvictedAccessInterrupt),

    #[error("Evicted access signalled without any recorded access")]
    NoEvictedAccess,

    #[error("Block {block_id} is referenced by the running transaction's accesses")]
    BlockInUse { block_id: BlockId },

    #[error("Block {block_id} on device {device} cannot be merged: {reason}")]
    CorruptBlock {
        device: DeviceId,
        block_id: BlockId,
        reason: String,
    },
}

impl AntiCacheError {
    /// The transaction should be retried after a merge.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AntiCacheError::EvictedAccess(_))
    }

    /// The table can no longer be assumed consistent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AntiCacheError::CorruptBlock { .. })
    }
}
