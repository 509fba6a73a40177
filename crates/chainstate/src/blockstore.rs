//! Full block bodies keyed by block hash.

use ledgerd_params::Hash256;
use ledgerd_primitives::encoding::{decode, encode};
use ledgerd_primitives::{Block, Transaction};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

pub struct BlockStore<S> {
    store: S,
}

impl<S> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn put(&self, batch: &mut WriteBatch, hash: &Hash256, block: &Block) {
        batch.put(Column::BlockData, hash, encode(block));
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.store.get(Column::BlockData, hash)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn transaction(
        &self,
        block_hash: &Hash256,
        index: u32,
    ) -> Result<Option<Transaction>, ChainStateError> {
        let Some(block) = self.get(block_hash)? else {
            return Ok(None);
        };
        Ok(block.transactions.into_iter().nth(index as usize))
    }
}
