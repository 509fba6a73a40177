use ledgerd_params::Hash256;
use ledgerd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ledgerd_primitives::OutPoint;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;
use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;
const MAX_UNDO_ENTRIES: usize = 1 << 24;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Outputs consumed by a block, in the order its inputs spent them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.encode_to(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_count(MAX_UNDO_ENTRIES)?;
        let mut spent = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let outpoint = OutPoint::decode_from(&mut decoder)?;
            let entry = UtxoEntry::decode(&decoder.read_var_bytes()?)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

pub struct UndoStore<S> {
    store: S,
}

impl<S> UndoStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UndoStore<S> {
    pub fn get(&self, block: &Hash256) -> Result<Option<BlockUndo>, ChainStateError> {
        match self.store.get(Column::BlockUndo, block)? {
            Some(bytes) => Ok(Some(BlockUndo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, block: &Hash256, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, block, undo.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, block: &Hash256) {
        batch.delete(Column::BlockUndo, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_preserves_spend_order() {
        let undo = BlockUndo {
            spent: (0..3)
                .map(|i| SpentOutput {
                    outpoint: OutPoint::new([i as u8; 32], i),
                    entry: UtxoEntry {
                        value: 10 * i64::from(i),
                        address: format!("addr{i}"),
                        height: i,
                        is_coinbase: i == 0,
                    },
                })
                .collect(),
        };
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = BlockUndo::default().encode();
        bytes[0] = 9;
        assert!(BlockUndo::decode(&bytes).is_err());
    }
}
