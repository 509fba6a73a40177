//! Unconfirmed transactions and the outpoints they claim.

use ledgerd_params::Hash256;
use ledgerd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ledgerd_primitives::{OutPoint, Transaction};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;
use crate::index::decode_hash;

const META_NEXT_PENDING_SEQ_KEY: &[u8] = b"next_pending_seq";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingEntry {
    pub txid: Hash256,
    /// Arrival order within the pool.
    pub seq: u64,
    pub received_at: u64,
    pub tx: Transaction,
}

impl PendingEntry {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.seq);
        encoder.write_u64_le(self.received_at);
        self.tx.encode_to(&mut encoder);
        encoder.into_inner()
    }

    fn decode(txid: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let seq = decoder.read_u64_le()?;
        let received_at = decoder.read_u64_le()?;
        let tx = Transaction::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            txid,
            seq,
            received_at,
            tx,
        })
    }
}

pub struct PendingPool<S> {
    store: S,
}

impl<S> PendingPool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> PendingPool<S> {
    pub fn get(&self, txid: &Hash256) -> Result<Option<PendingEntry>, ChainStateError> {
        match self.store.get(Column::PendingTx, txid)? {
            Some(bytes) => Ok(Some(PendingEntry::decode(*txid, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, txid: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.store.get(Column::PendingTx, txid)?.is_some())
    }

    /// Pending transaction currently claiming `outpoint`, if any.
    pub fn claimant(&self, outpoint: &OutPoint) -> Result<Option<Hash256>, ChainStateError> {
        match self.store.get(Column::PendingSpend, &outpoint.key())? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn next_seq(&self) -> Result<u64, ChainStateError> {
        match self.store.get(Column::Meta, META_NEXT_PENDING_SEQ_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptIndex("invalid pending sequence"))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Stages `entry` and its input claims; advances the arrival counter.
    pub fn insert(&self, batch: &mut WriteBatch, entry: &PendingEntry) {
        batch.put(Column::PendingTx, entry.txid, entry.encode());
        for input in &entry.tx.inputs {
            batch.put(Column::PendingSpend, input.prevout.key(), entry.txid);
        }
        batch.put(
            Column::Meta,
            META_NEXT_PENDING_SEQ_KEY,
            (entry.seq + 1).to_le_bytes(),
        );
    }

    pub fn remove(&self, batch: &mut WriteBatch, entry: &PendingEntry) {
        batch.delete(Column::PendingTx, entry.txid);
        for input in &entry.tx.inputs {
            batch.delete(Column::PendingSpend, input.prevout.key());
        }
    }

    /// Every pending transaction in arrival order.
    pub fn all(&self) -> Result<Vec<PendingEntry>, ChainStateError> {
        let rows = self.store.scan_prefix(Column::PendingTx, &[])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            out.push(PendingEntry::decode(decode_hash(&key)?, &value)?);
        }
        out.sort_by_key(|entry| entry.seq);
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, ChainStateError> {
        let mut count = 0usize;
        self.store
            .for_each_prefix(Column::PendingTx, &[], &mut |_, _| {
                count += 1;
                Ok(())
            })?;
        Ok(count)
    }

    /// Stages removal of `tx` if pending and of every pending transaction
    /// whose claims overlap its inputs. Returns the evicted conflicts.
    pub fn settle(
        &self,
        batch: &mut WriteBatch,
        txid: &Hash256,
        tx: &Transaction,
    ) -> Result<Vec<Hash256>, ChainStateError> {
        let mut evicted = Vec::new();
        if let Some(entry) = self.get(txid)? {
            self.remove(batch, &entry);
        }
        for input in &tx.inputs {
            let Some(claimant) = self.claimant(&input.prevout)? else {
                continue;
            };
            if claimant == *txid || evicted.contains(&claimant) {
                continue;
            }
            if let Some(entry) = self.get(&claimant)? {
                self.remove(batch, &entry);
                evicted.push(claimant);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::{TxIn, TxOut};
    use ledgerd_storage::memory::MemoryStore;

    fn tx(prev: OutPoint, tag: u64) -> Transaction {
        Transaction {
            inputs: vec![TxIn { prevout: prev }],
            outputs: vec![TxOut {
                value: 1,
                address: "dest".to_string(),
            }],
            fee: 0,
            timestamp: tag,
            height: 0,
        }
    }

    fn entry(tx: Transaction, seq: u64) -> PendingEntry {
        PendingEntry {
            txid: tx.txid(),
            seq,
            received_at: 100 + seq,
            tx,
        }
    }

    #[test]
    fn insert_claims_and_orders() {
        let store = MemoryStore::new();
        let pool = PendingPool::new(&store);
        let a = entry(tx(OutPoint::new([1u8; 32], 0), 1), 0);
        let b = entry(tx(OutPoint::new([2u8; 32], 0), 2), 1);
        let mut batch = WriteBatch::new();
        pool.insert(&mut batch, &b);
        pool.insert(&mut batch, &a);
        store.write_batch(&batch).expect("commit");

        let all = pool.all().expect("all");
        assert_eq!(all, vec![a.clone(), b.clone()]);
        assert_eq!(
            pool.claimant(&OutPoint::new([2u8; 32], 0)).expect("claim"),
            Some(b.txid)
        );
        assert_eq!(pool.next_seq().expect("seq"), 1);
    }

    #[test]
    fn settle_removes_included_and_conflicts() {
        let store = MemoryStore::new();
        let pool = PendingPool::new(&store);
        let shared = OutPoint::new([7u8; 32], 3);
        let pending = entry(tx(shared, 1), 0);
        let unrelated = entry(tx(OutPoint::new([8u8; 32], 0), 2), 1);
        let mut batch = WriteBatch::new();
        pool.insert(&mut batch, &pending);
        pool.insert(&mut batch, &unrelated);
        store.write_batch(&batch).expect("commit");

        let rival = tx(shared, 9);
        let mut batch = WriteBatch::new();
        let evicted = pool
            .settle(&mut batch, &rival.txid(), &rival)
            .expect("settle");
        store.write_batch(&batch).expect("commit");
        assert_eq!(evicted, vec![pending.txid]);
        assert_eq!(pool.claimant(&shared).expect("claim"), None);
        assert_eq!(pool.len().expect("len"), 1);

        let mut batch = WriteBatch::new();
        let evicted = pool
            .settle(&mut batch, &unrelated.txid, &unrelated.tx)
            .expect("settle");
        store.write_batch(&batch).expect("commit");
        assert!(evicted.is_empty());
        assert_eq!(pool.len().expect("len"), 0);
    }
}
