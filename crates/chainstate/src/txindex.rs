//! Canonical transaction locations.

use ledgerd_params::Hash256;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

const TX_LOCATION_LEN: usize = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub height: u32,
    pub index: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; TX_LOCATION_LEN] {
        let mut out = [0u8; TX_LOCATION_LEN];
        out[0..32].copy_from_slice(&self.block_hash);
        out[32..36].copy_from_slice(&self.height.to_le_bytes());
        out[36..40].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_LOCATION_LEN {
            return None;
        }
        Some(Self {
            block_hash: bytes[0..32].try_into().ok()?,
            height: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
            index: u32::from_le_bytes(bytes[36..40].try_into().ok()?),
        })
    }
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, txid, location.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, txid: &Hash256) {
        batch.delete(Column::TxIndex, txid);
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        TxLocation::decode(&bytes)
            .ok_or(ChainStateError::CorruptIndex("invalid tx index entry"))
            .map(Some)
    }
}
