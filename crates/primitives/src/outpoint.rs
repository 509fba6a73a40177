//! Reference to a transaction output.

use std::fmt;

use ledgerd_params::{hash256_to_hex, Hash256};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub const ENCODED_LEN: usize = 36;

    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// Fixed-width key: txid followed by the big-endian index, so keys of one
    /// transaction sort by output position.
    pub fn key(&self) -> [u8; Self::ENCODED_LEN] {
        let mut key = [0u8; Self::ENCODED_LEN];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let index = u32::from_be_bytes([key[32], key[33], key[34], key[35]]);
        Some(Self { txid, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash256_to_hex(&self.txid), self.index)
    }
}

impl Encodable for OutPoint {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { txid, index })
    }
}
