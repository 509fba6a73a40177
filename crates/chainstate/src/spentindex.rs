//! Spent output index: outpoint to the canonical transaction that consumed it.

use ledgerd_params::Hash256;
use ledgerd_primitives::OutPoint;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

const SPENT_RECORD_LEN: usize = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpentRecord {
    pub txid: Hash256,
    pub input_index: u32,
    pub height: u32,
}

impl SpentRecord {
    pub fn encode(&self) -> [u8; SPENT_RECORD_LEN] {
        let mut out = [0u8; SPENT_RECORD_LEN];
        out[0..32].copy_from_slice(&self.txid);
        out[32..36].copy_from_slice(&self.input_index.to_le_bytes());
        out[36..40].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SPENT_RECORD_LEN {
            return None;
        }
        Some(Self {
            txid: bytes[0..32].try_into().ok()?,
            input_index: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
            height: u32::from_le_bytes(bytes[36..40].try_into().ok()?),
        })
    }
}

pub struct SpentIndex<S> {
    store: S,
}

impl<S> SpentIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> SpentIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, outpoint: &OutPoint, record: SpentRecord) {
        batch.put(Column::SpentIndex, outpoint.key(), record.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::SpentIndex, outpoint.key());
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SpentRecord>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::SpentIndex, &outpoint.key())? else {
            return Ok(None);
        };
        SpentRecord::decode(&bytes)
            .ok_or(ChainStateError::CorruptIndex("invalid spent index entry"))
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_codec() {
        let record = SpentRecord {
            txid: [4u8; 32],
            input_index: 2,
            height: 77,
        };
        assert_eq!(SpentRecord::decode(&record.encode()), Some(record));
        assert_eq!(SpentRecord::decode(&[0u8; 12]), None);
    }
}
