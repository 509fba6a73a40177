//! Block index: every accepted block, the canonical height map and the tip.

use ledgerd_params::Hash256;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::BlockHeader;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::error::ChainStateError;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

const STATUS_HAVE_DATA: u8 = 1 << 0;
const STATUS_CANONICAL: u8 = 1 << 1;
const STATUS_FAILED: u8 = 1 << 2;

const ENTRY_LEN: usize = 32 + 4 + 8 + 8 + 32 + 1 + 4 + 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub prev_hash: Hash256,
    pub height: u32,
    pub timestamp: u64,
    pub difficulty: u64,
    /// Big-endian 256-bit sum of difficulty from genesis through this block.
    pub chainwork: [u8; 32],
    pub status: u8,
    pub tx_count: u32,
    pub size: u32,
}

impl BlockIndexEntry {
    pub fn from_header(
        header: &BlockHeader,
        parent_work: U256,
        tx_count: usize,
        size: usize,
    ) -> Self {
        let work = parent_work.saturating_add(U256::from(header.difficulty));
        Self {
            prev_hash: header.prev_hash,
            height: header.height,
            timestamp: header.timestamp,
            difficulty: header.difficulty,
            chainwork: work.to_big_endian(),
            status: STATUS_HAVE_DATA,
            tx_count: u32::try_from(tx_count).unwrap_or(u32::MAX),
            size: u32::try_from(size).unwrap_or(u32::MAX),
        }
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn has_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }

    pub fn is_canonical(&self) -> bool {
        self.status & STATUS_CANONICAL != 0
    }

    pub fn is_failed(&self) -> bool {
        self.status & STATUS_FAILED != 0
    }

    pub fn set_canonical(&mut self, canonical: bool) {
        if canonical {
            self.status |= STATUS_CANONICAL;
        } else {
            self.status &= !STATUS_CANONICAL;
        }
    }

    pub fn mark_failed(&mut self) {
        self.status |= STATUS_FAILED;
        self.status &= !STATUS_CANONICAL;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(ENTRY_LEN);
        encoder.write_hash(&self.prev_hash);
        encoder.write_u32_le(self.height);
        encoder.write_u64_le(self.timestamp);
        encoder.write_u64_le(self.difficulty);
        encoder.write_bytes(&self.chainwork);
        encoder.write_u8(self.status);
        encoder.write_u32_le(self.tx_count);
        encoder.write_u32_le(self.size);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let entry = Self {
            prev_hash: decoder.read_hash()?,
            height: decoder.read_u32_le()?,
            timestamp: decoder.read_u64_le()?,
            difficulty: decoder.read_u64_le()?,
            chainwork: decoder.read_fixed::<32>()?,
            status: decoder.read_u8()?,
            tx_count: decoder.read_u32_le()?,
            size: decoder.read_u32_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(entry)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub chainwork: [u8; 32],
}

impl ChainTip {
    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }
}

pub struct ChainIndex<S> {
    store: S,
}

impl<S> ChainIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, ChainStateError> {
        match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => Ok(Some(BlockIndexEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &BlockIndexEntry) {
        batch.put(Column::BlockIndex, hash, entry.encode());
    }

    pub fn best_block(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash = decode_hash(&bytes)?;
        let entry = self
            .get(&hash)?
            .ok_or(ChainStateError::CorruptIndex("best block missing from index"))?;
        Ok(Some(ChainTip {
            hash,
            height: entry.height,
            chainwork: entry.chainwork,
        }))
    }

    pub fn set_best_block(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *hash);
    }

    pub fn clear_best_block(&self, batch: &mut WriteBatch) {
        batch.delete(Column::Meta, META_BEST_BLOCK_KEY);
    }

    pub fn height_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, height: u32, hash: &Hash256) {
        batch.put(Column::HeightIndex, height_key(height), *hash);
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::HeightIndex, height_key(height));
    }

    /// True when `hash` sits on the canonical chain.
    pub fn is_canonical(&self, hash: &Hash256, height: u32) -> Result<bool, ChainStateError> {
        Ok(self.height_hash(height)? == Some(*hash))
    }
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub(crate) fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainStateError> {
    bytes
        .try_into()
        .map_err(|_| ChainStateError::CorruptIndex("invalid hash length"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_storage::memory::MemoryStore;

    fn entry(height: u32) -> BlockIndexEntry {
        BlockIndexEntry {
            prev_hash: [height as u8; 32],
            height,
            timestamp: 1_000 + u64::from(height),
            difficulty: 10,
            chainwork: U256::from(10 * (u64::from(height) + 1)).to_big_endian(),
            status: STATUS_HAVE_DATA,
            tx_count: 1,
            size: 200,
        }
    }

    #[test]
    fn entry_codec_and_flags() {
        let mut value = entry(3);
        assert!(value.has_data());
        assert!(!value.is_canonical());
        value.set_canonical(true);
        assert!(value.is_canonical());
        assert_eq!(BlockIndexEntry::decode(&value.encode()), Ok(value.clone()));
        value.mark_failed();
        assert!(value.is_failed());
        assert!(!value.is_canonical());
        assert_eq!(value.chainwork_value(), U256::from(40u64));
    }

    #[test]
    fn best_block_and_height_map() {
        let store = MemoryStore::new();
        let index = ChainIndex::new(&store);
        assert_eq!(index.best_block().expect("tip"), None);

        let hash = [9u8; 32];
        let mut batch = WriteBatch::new();
        index.put(&mut batch, &hash, &entry(0));
        index.set_best_block(&mut batch, &hash);
        index.set_height_hash(&mut batch, 0, &hash);
        store.write_batch(&batch).expect("commit");

        let tip = index.best_block().expect("tip").expect("some tip");
        assert_eq!(tip.hash, hash);
        assert_eq!(tip.height, 0);
        assert!(index.is_canonical(&hash, 0).expect("canonical"));
        assert!(!index.is_canonical(&[1u8; 32], 0).expect("canonical"));
    }

    #[test]
    fn dangling_best_block_is_corruption() {
        let store = MemoryStore::new();
        let index = ChainIndex::new(&store);
        let mut batch = WriteBatch::new();
        index.set_best_block(&mut batch, &[5u8; 32]);
        store.write_batch(&batch).expect("commit");
        assert!(matches!(
            index.best_block(),
            Err(ChainStateError::CorruptIndex(_))
        ));
    }
}
