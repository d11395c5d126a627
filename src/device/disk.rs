//! File-per-block disk backend.
//!
//! Writes each encoded block to its own file under the device directory.
//! Uses tokio's async file I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::cache::block::BlockId;
use crate::device::store::{BlockStore, StoreError};

/// Disk-backed block store.
#[derive(Debug)]
pub struct DiskStore {
    /// Base directory for block files.
    root: PathBuf,

    /// Transfer statistics.
    stats: DiskStats,
}

#[derive(Debug, Default)]
pub struct DiskStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: DiskStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate the file path for a block.
    fn block_path(&self, block_id: BlockId) -> PathBuf {
        // Two-level layout keeps directories small:
        // block_id 12345 → 12/12345.block
        let shard = block_id / 1000;
        self.root
            .join(format!("{shard}"))
            .join(format!("{block_id}.block"))
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Total size of the block files under the root.
    pub async fn disk_usage(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if entry.path().extension().is_some_and(|ext| ext == "block") {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl BlockStore for DiskStore {
    fn kind(&self) -> &'static str {
        "disk"
    }

    async fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<(), StoreError> {
        let path = self.block_path(block_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&path, data).await?;

        debug!(
            block_id,
            path = %path.display(),
            size = data.len(),
            "Wrote block to disk"
        );

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>, StoreError> {
        let path = self.block_path(block_id);
        if !fs::try_exists(&path).await? {
            return Err(StoreError::FileNotFound(path));
        }

        let data = fs::read(&path).await?;

        debug!(
            block_id,
            path = %path.display(),
            size = data.len(),
            "Read block from disk"
        );

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    async fn remove_block(&self, block_id: BlockId) -> Result<(), StoreError> {
        let path = self.block_path(block_id);
        if !fs::try_exists(&path).await? {
            return Err(StoreError::FileNotFound(path));
        }
        fs::remove_file(&path).await?;
        debug!(block_id, path = %path.display(), "Deleted block file");
        Ok(())
    }
}
