//! Unspent output set backed by the storage trait.

use ledgerd_params::money::Amount;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::OutPoint;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

const META_UTXO_STATS_KEY: &[u8] = b"utxo_stats";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub address: String,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Whether this output may be spent by a block at `spend_height`.
    pub fn is_mature_at(&self, spend_height: u32, coinbase_maturity: u32) -> bool {
        !self.is_coinbase || u64::from(spend_height) >= u64::from(self.height) + u64::from(coinbase_maturity)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(14 + self.address.len());
        encoder.write_i64_le(self.value);
        encoder.write_var_str(&self.address);
        encoder.write_u32_le(self.height);
        encoder.write_bool(self.is_coinbase);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let address = decoder.read_var_str()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_bool()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            address,
            height,
            is_coinbase,
        })
    }
}

/// Running totals over the unspent set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UtxoStats {
    pub count: u64,
    pub total_value: Amount,
    pub coinbase_count: u64,
}

impl UtxoStats {
    pub fn add(&mut self, entry: &UtxoEntry) -> Result<(), ChainStateError> {
        self.count += 1;
        self.total_value = self
            .total_value
            .checked_add(entry.value)
            .ok_or(ChainStateError::ValueOutOfRange)?;
        if entry.is_coinbase {
            self.coinbase_count += 1;
        }
        Ok(())
    }

    pub fn remove(&mut self, entry: &UtxoEntry) -> Result<(), ChainStateError> {
        self.count = self
            .count
            .checked_sub(1)
            .ok_or(ChainStateError::CorruptIndex("utxo count underflow"))?;
        self.total_value -= entry.value;
        if entry.is_coinbase {
            self.coinbase_count = self.coinbase_count.saturating_sub(1);
        }
        Ok(())
    }

    fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.count.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_value.to_le_bytes());
        out[16..24].copy_from_slice(&self.coinbase_count.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let stats = Self {
            count: decoder.read_u64_le()?,
            total_value: decoder.read_i64_le()?,
            coinbase_count: decoder.read_u64_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(stats)
    }
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        match self.store.get(Column::Utxo, &outpoint.key())? {
            Some(bytes) => Ok(Some(UtxoEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        batch.put(Column::Utxo, outpoint.key(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, outpoint.key());
    }

    /// Every unspent output, in key order.
    pub fn all(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, ChainStateError> {
        let rows = self.store.scan_prefix(Column::Utxo, &[])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let outpoint =
                OutPoint::from_key(&key).ok_or(ChainStateError::CorruptIndex("invalid utxo key"))?;
            out.push((outpoint, UtxoEntry::decode(&value)?));
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<UtxoStats, ChainStateError> {
        match self.store.get(Column::Meta, META_UTXO_STATS_KEY)? {
            Some(bytes) => Ok(UtxoStats::decode(&bytes)?),
            None => Ok(UtxoStats::default()),
        }
    }

    pub fn put_stats(&self, batch: &mut WriteBatch, stats: &UtxoStats) {
        batch.put(Column::Meta, META_UTXO_STATS_KEY, stats.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maturity_boundary() {
        let entry = UtxoEntry {
            value: 50,
            address: "miner".to_string(),
            height: 10,
            is_coinbase: true,
        };
        assert!(!entry.is_mature_at(109, 100));
        assert!(entry.is_mature_at(110, 100));
        let regular = UtxoEntry {
            is_coinbase: false,
            ..entry
        };
        assert!(regular.is_mature_at(10, 100));
    }

    #[test]
    fn stats_track_adds_and_removes() {
        let coinbase = UtxoEntry {
            value: 50,
            address: "a".to_string(),
            height: 0,
            is_coinbase: true,
        };
        let plain = UtxoEntry {
            value: 7,
            address: "b".to_string(),
            height: 1,
            is_coinbase: false,
        };
        let mut stats = UtxoStats::default();
        stats.add(&coinbase).expect("add");
        stats.add(&plain).expect("add");
        stats.remove(&coinbase).expect("remove");
        assert_eq!(
            stats,
            UtxoStats {
                count: 1,
                total_value: 7,
                coinbase_count: 0
            }
        );
        assert_eq!(UtxoStats::decode(&stats.encode()), Ok(stats));
        let mut empty = UtxoStats::default();
        assert!(empty.remove(&plain).is_err());
    }
}
