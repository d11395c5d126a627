//! Block store backends.
//!
//! A [`BlockStore`] is the byte-level boundary of an anti-cache device: it
//! stores opaque encoded blocks under a block id. Capacity accounting and
//! placement live in the registry, not here.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::block::BlockId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block {0} not found")]
    BlockNotFound(BlockId),

    #[error("Block file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    async fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<(), StoreError>;

    async fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>, StoreError>;

    async fn remove_block(&self, block_id: BlockId) -> Result<(), StoreError>;
}

/// Blocks held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blocks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.lock().await.is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<(), StoreError> {
        self.blocks.lock().await.insert(block_id, data.to_vec());
        Ok(())
    }

    async fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>, StoreError> {
        self.blocks
            .lock()
            .await
            .get(&block_id)
            .cloned()
            .ok_or(StoreError::BlockNotFound(block_id))
    }

    async fn remove_block(&self, block_id: BlockId) -> Result<(), StoreError> {
        self.blocks
            .lock()
            .await
            .remove(&block_id)
            .map(|_| ())
            .ok_or(StoreError::BlockNotFound(block_id))
    }
}
