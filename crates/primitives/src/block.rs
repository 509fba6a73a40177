//! Block header and block types.

use ledgerd_params::constants::{GENESIS_PREV_HASH, MAX_BLOCK_TRANSACTIONS};
use ledgerd_params::money::Amount;
use ledgerd_params::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub prev_hash: Hash256,
    pub height: u32,
    pub timestamp: u64,
    pub nonce: u64,
    /// Work contributed by this block; summed into chainwork.
    pub difficulty: u64,
    pub merkle_root: Hash256,
    pub miner: String,
    pub reward: Amount,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash == GENESIS_PREV_HASH
    }
}

impl Encodable for BlockHeader {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.prev_hash);
        encoder.write_u32_le(self.height);
        encoder.write_u64_le(self.timestamp);
        encoder.write_u64_le(self.nonce);
        encoder.write_u64_le(self.difficulty);
        encoder.write_hash(&self.merkle_root);
        encoder.write_var_str(&self.miner);
        encoder.write_i64_le(self.reward);
    }
}

impl Decodable for BlockHeader {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prev_hash: decoder.read_hash()?,
            height: decoder.read_u32_le()?,
            timestamp: decoder.read_u64_le()?,
            nonce: decoder.read_u64_le()?,
            difficulty: decoder.read_u64_le()?,
            merkle_root: decoder.read_hash()?,
            miner: decoder.read_var_str()?,
            reward: decoder.read_i64_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn size(&self) -> usize {
        crate::encoding::encode(self).len()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }
}

impl Encodable for Block {
    fn encode_to(&self, encoder: &mut Encoder) {
        self.header.encode_to(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_to(encoder);
        }
    }
}

impl Decodable for Block {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(decoder)?;
        let count = decoder.read_count(MAX_BLOCK_TRANSACTIONS)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Pairwise sha256d tree over txids; an odd layer repeats its last entry.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    let mut layer = txids.to_vec();
    if layer.is_empty() {
        return [0u8; 32];
    }
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }
        layer = layer
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    layer[0]
}
