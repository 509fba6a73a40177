//! Per-address indexes: unspent outpoints and the canonical transactions that
//! touched each address.

use ledgerd_params::money::Amount;
use ledgerd_params::Hash256;
use ledgerd_primitives::{address_key, AddressKey, OutPoint};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

const ADDRESS_KEY_LEN: usize = 32;
const ADDRESS_OUTPOINT_KEY_LEN: usize = ADDRESS_KEY_LEN + OutPoint::ENCODED_LEN;
const ADDRESS_TX_KEY_LEN: usize = ADDRESS_KEY_LEN + 4 + 32;

pub fn address_outpoint_key(address: &AddressKey, outpoint: &OutPoint) -> [u8; ADDRESS_OUTPOINT_KEY_LEN] {
    let mut key = [0u8; ADDRESS_OUTPOINT_KEY_LEN];
    key[..ADDRESS_KEY_LEN].copy_from_slice(address);
    key[ADDRESS_KEY_LEN..].copy_from_slice(&outpoint.key());
    key
}

pub fn address_tx_key(address: &AddressKey, height: u32, txid: &Hash256) -> [u8; ADDRESS_TX_KEY_LEN] {
    let mut key = [0u8; ADDRESS_TX_KEY_LEN];
    key[..ADDRESS_KEY_LEN].copy_from_slice(address);
    key[ADDRESS_KEY_LEN..ADDRESS_KEY_LEN + 4].copy_from_slice(&height.to_be_bytes());
    key[ADDRESS_KEY_LEN + 4..].copy_from_slice(txid);
    key
}

/// Net value a confirmed transaction moved into (positive) or out of an address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressTxEntry {
    pub height: u32,
    pub txid: Hash256,
    pub delta: Amount,
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn insert_outpoint(&self, batch: &mut WriteBatch, address: &str, outpoint: &OutPoint) {
        let key = address_outpoint_key(&address_key(address), outpoint);
        batch.put(Column::AddressOutpoint, key, [0u8; 0]);
    }

    pub fn delete_outpoint(&self, batch: &mut WriteBatch, address: &str, outpoint: &OutPoint) {
        let key = address_outpoint_key(&address_key(address), outpoint);
        batch.delete(Column::AddressOutpoint, key);
    }

    pub fn outpoints(&self, address: &str) -> Result<Vec<OutPoint>, ChainStateError> {
        let prefix = address_key(address);
        let rows = self.store.scan_prefix(Column::AddressOutpoint, &prefix)?;
        rows.into_iter()
            .map(|(key, _)| {
                if key.len() != ADDRESS_OUTPOINT_KEY_LEN {
                    return Err(ChainStateError::CorruptIndex("invalid address outpoint key"));
                }
                OutPoint::from_key(&key[ADDRESS_KEY_LEN..])
                    .ok_or(ChainStateError::CorruptIndex("invalid address outpoint key"))
            })
            .collect()
    }

    pub fn put_tx(
        &self,
        batch: &mut WriteBatch,
        address: &AddressKey,
        height: u32,
        txid: &Hash256,
        delta: Amount,
    ) {
        batch.put(
            Column::AddressTx,
            address_tx_key(address, height, txid),
            delta.to_le_bytes(),
        );
    }

    pub fn delete_tx(&self, batch: &mut WriteBatch, address: &AddressKey, height: u32, txid: &Hash256) {
        batch.delete(Column::AddressTx, address_tx_key(address, height, txid));
    }

    /// Transactions touching `address`, ascending by height.
    pub fn txs(&self, address: &str) -> Result<Vec<AddressTxEntry>, ChainStateError> {
        let prefix = address_key(address);
        let rows = self.store.scan_prefix(Column::AddressTx, &prefix)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() != ADDRESS_TX_KEY_LEN || value.len() != 8 {
                return Err(ChainStateError::CorruptIndex("invalid address tx entry"));
            }
            let mut height = [0u8; 4];
            height.copy_from_slice(&key[ADDRESS_KEY_LEN..ADDRESS_KEY_LEN + 4]);
            let mut txid = [0u8; 32];
            txid.copy_from_slice(&key[ADDRESS_KEY_LEN + 4..]);
            let mut delta = [0u8; 8];
            delta.copy_from_slice(&value);
            out.push(AddressTxEntry {
                height: u32::from_be_bytes(height),
                txid,
                delta: i64::from_le_bytes(delta),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_storage::memory::MemoryStore;

    #[test]
    fn outpoints_are_scoped_to_address() {
        let store = MemoryStore::new();
        let index = AddressIndex::new(&store);
        let mut batch = WriteBatch::new();
        let a = OutPoint::new([1u8; 32], 0);
        let b = OutPoint::new([2u8; 32], 1);
        index.insert_outpoint(&mut batch, "alice", &a);
        index.insert_outpoint(&mut batch, "alice", &b);
        index.insert_outpoint(&mut batch, "bob", &a);
        store.write_batch(&batch).expect("commit");

        assert_eq!(index.outpoints("alice").expect("scan"), vec![a, b]);
        assert_eq!(index.outpoints("bob").expect("scan"), vec![a]);
        assert!(index.outpoints("carol").expect("scan").is_empty());

        let mut batch = WriteBatch::new();
        index.delete_outpoint(&mut batch, "alice", &a);
        store.write_batch(&batch).expect("commit");
        assert_eq!(index.outpoints("alice").expect("scan"), vec![b]);
    }

    #[test]
    fn tx_history_sorted_by_height() {
        let store = MemoryStore::new();
        let index = AddressIndex::new(&store);
        let alice = address_key("alice");
        let mut batch = WriteBatch::new();
        index.put_tx(&mut batch, &alice, 300, &[3u8; 32], -5);
        index.put_tx(&mut batch, &alice, 2, &[9u8; 32], 50);
        store.write_batch(&batch).expect("commit");
        let txs = index.txs("alice").expect("txs");
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].height, 2);
        assert_eq!(txs[0].delta, 50);
        assert_eq!(txs[1].height, 300);
        assert_eq!(txs[1].delta, -5);
    }
}
