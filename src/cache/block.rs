//! Evicted block types and the block codec.
//!
//! A block is an immutable batch of serialized tuples written to one device in
//! a single operation. Entry order is the tuple's offset inside the block.
//!
//! Wire format:
//! ```text
//! [flags: u8][payload_len: u32 LE][payload]
//! payload = bincode(Block), zstd-compressed when flags & COMPRESSED
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::{TableId, Tuple, TupleId};

/// Identifies a block. Unique across every device of a registry.
pub type BlockId = i32;

const FLAG_COMPRESSED: u8 = 0x01;
const HEADER_LEN: usize = 5;

/// Fixed per-block overhead (codec header, table id, entry count) that a
/// planner subtracts from the block budget before packing tuples.
pub const BLOCK_OVERHEAD_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Block encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Block decoding failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Zstd failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Corrupt block: {0}")]
    Corrupt(String),
}

/// One serialized tuple inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub table: TableId,
    pub tuple: TupleId,
    pub parent: Option<TupleId>,
    pub data: Bytes,
}

impl BlockEntry {
    pub fn new(table: TableId, tuple: TupleId, t: &Tuple) -> Self {
        Self {
            table,
            tuple,
            parent: t.parent,
            data: t.data.clone(),
        }
    }

    /// Rebuild the resident tuple.
    pub fn to_tuple(&self) -> Tuple {
        Tuple {
            parent: self.parent,
            data: self.data.clone(),
        }
    }
}

/// A batch of evicted tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Table the eviction was issued against.
    pub table: TableId,

    /// Entries by offset.
    pub entries: Vec<BlockEntry>,
}

impl Block {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            entries: Vec::new(),
        }
    }

    /// Append an entry, returning its offset.
    pub fn push(&mut self, entry: BlockEntry) -> i32 {
        self.entries.push(entry);
        (self.entries.len() - 1) as i32
    }

    pub fn entry(&self, offset: i32) -> Option<&BlockEntry> {
        usize::try_from(offset).ok().and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether entries belong to more than one table.
    pub fn is_batched(&self) -> bool {
        self.entries.iter().any(|e| e.table != self.table)
    }
}

/// Encodes and decodes blocks.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    compress: bool,
    zstd_level: i32,
}

impl BlockCodec {
    pub fn new(compress: bool, zstd_level: i32) -> Self {
        Self {
            compress,
            zstd_level,
        }
    }

    pub fn encode(&self, block: &Block) -> Result<Vec<u8>, CodecError> {
        let raw = bincode::serialize(block).map_err(CodecError::Encode)?;
        let compressed = if self.compress {
            Some(zstd::encode_all(raw.as_slice(), self.zstd_level)?)
        } else {
            None
        };
        // Incompressible blocks are stored raw, so encoding never grows a block.
        let (flags, payload) = match compressed {
            Some(c) if c.len() < raw.len() => (FLAG_COMPRESSED, c),
            _ => (0, raw),
        };

        let len = u32::try_from(payload.len())
            .map_err(|_| CodecError::Corrupt(format!("payload of {} bytes", payload.len())))?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(flags);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Block, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Corrupt(format!(
                "{} bytes is shorter than the header",
                data.len()
            )));
        }
        let flags = data[0];
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(CodecError::Corrupt(format!("unknown flags {flags:#04x}")));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[1..HEADER_LEN]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let payload = &data[HEADER_LEN..];
        if payload.len() != len {
            return Err(CodecError::Corrupt(format!(
                "header says {len} payload bytes, found {}",
                payload.len()
            )));
        }

        if flags & FLAG_COMPRESSED != 0 {
            let raw = zstd::decode_all(payload)?;
            bincode::deserialize(&raw).map_err(CodecError::Decode)
        } else {
            bincode::deserialize(payload).map_err(CodecError::Decode)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let mut block = Block::new(TableId(1));
        block.push(BlockEntry::new(TableId(1), 4, &Tuple::new(vec![1u8; 300])));
        block.push(BlockEntry::new(
            TableId(2),
            9,
            &Tuple::with_parent(4, vec![2u8; 300]),
        ));
        block
    }

    #[test]
    fn test_compressed_block_roundtrip() {
        let codec = BlockCodec::new(true, 3);
        let block = sample_block();
        let encoded = codec.encode(&block).unwrap();
        assert_eq!(encoded[0], FLAG_COMPRESSED);
        // 600 bytes of repeated data compress well.
        assert!(encoded.len() < 300);

        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.is_batched());
        assert_eq!(decoded.entry(1).unwrap().to_tuple().parent, Some(4));
    }

    #[test]
    fn test_incompressible_block_stored_raw() {
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let noise: Vec<u8> = (0..64)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let mut block = Block::new(TableId(1));
        block.push(BlockEntry::new(TableId(1), 0, &Tuple::new(noise)));

        let raw = BlockCodec::new(false, 3).encode(&block).unwrap();
        let encoded = BlockCodec::new(true, 3).encode(&block).unwrap();
        assert_eq!(encoded[0], 0);
        assert_eq!(encoded, raw);
        assert_eq!(BlockCodec::new(true, 3).decode(&encoded).unwrap(), block);
    }

    #[test]
    fn test_detects_truncation() {
        let codec = BlockCodec::new(false, 3);
        let mut encoded = codec.encode(&sample_block()).unwrap();
        encoded.truncate(encoded.len() - 10);
        assert!(matches!(codec.decode(&encoded), Err(CodecError::Corrupt(_))));
        assert!(matches!(codec.decode(&[0u8; 2]), Err(CodecError::Corrupt(_))));
    }

    #[test]
    fn test_uncompressed_size_within_budget() {
        let codec = BlockCodec::new(false, 3);
        let block = sample_block();
        let budget: usize = block
            .entries
            .iter()
            .map(|e| e.to_tuple().serialized_size())
            .sum::<usize>()
            + BLOCK_OVERHEAD_BYTES;
        assert!(codec.encode(&block).unwrap().len() <= budget);
    }

    #[test]
    fn test_entry_out_of_range() {
        let block = sample_block();
        assert!(block.entry(-1).is_none());
        assert!(block.entry(2).is_none());
    }
}
