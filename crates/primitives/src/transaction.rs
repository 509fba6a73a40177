//! Transaction types.

use ledgerd_params::constants::MAX_TX_IO;
use ledgerd_params::money::Amount;
use ledgerd_params::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub address: String,
}

/// A transfer of value. A transaction with no inputs is a coinbase.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Declared fee; inputs must cover outputs plus this amount.
    pub fee: Amount,
    pub timestamp: u64,
    /// Height of the block a coinbase belongs to, so no two canonical
    /// coinbases share a txid. Zero for every other transaction.
    pub height: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encoded())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.estimated_size());
        self.encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn size(&self) -> usize {
        self.encoded().len()
    }

    /// Sum of output values, `None` on overflow.
    pub fn output_total(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, out| acc.checked_add(out.value))
    }

    fn estimated_size(&self) -> usize {
        28 + self.inputs.len() * OutPoint::ENCODED_LEN
            + self
                .outputs
                .iter()
                .map(|out| 9 + out.address.len())
                .sum::<usize>()
    }
}

impl Encodable for Transaction {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.encode_to(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_str(&output.address);
        }
        encoder.write_i64_le(self.fee);
        encoder.write_u64_le(self.timestamp);
        encoder.write_u32_le(self.height);
    }
}

impl Decodable for Transaction {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let input_count = decoder.read_count(MAX_TX_IO)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn {
                prevout: OutPoint::decode_from(decoder)?,
            });
        }
        let output_count = decoder.read_count(MAX_TX_IO)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let address = decoder.read_var_str()?;
            outputs.push(TxOut { value, address });
        }
        let fee = decoder.read_i64_le()?;
        let timestamp = decoder.read_u64_le()?;
        let height = decoder.read_u32_le()?;
        Ok(Self {
            inputs,
            outputs,
            fee,
            timestamp,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};

    fn sample() -> Transaction {
        Transaction {
            inputs: vec![TxIn {
                prevout: OutPoint::new([3u8; 32], 0),
            }],
            outputs: vec![
                TxOut {
                    value: 40,
                    address: "alice".to_string(),
                },
                TxOut {
                    value: 59,
                    address: "bob".to_string(),
                },
            ],
            fee: 1,
            timestamp: 1_700_000_000,
            height: 0,
        }
    }

    #[test]
    fn txid_changes_with_content() {
        let tx = sample();
        let mut other = tx.clone();
        other.outputs[1].value = 58;
        assert_ne!(tx.txid(), other.txid());
        assert_eq!(decode::<Transaction>(&encode(&tx)), Ok(tx.clone()));
        assert_eq!(tx.size(), tx.encoded().len());
    }

    #[test]
    fn coinbase_txid_commits_to_height() {
        let mut first = sample();
        first.inputs.clear();
        let mut second = first.clone();
        second.height = 1;
        assert_ne!(first.txid(), second.txid());
        assert_eq!(decode::<Transaction>(&encode(&second)), Ok(second));
    }

    #[test]
    fn coinbase_has_no_inputs() {
        let mut tx = sample();
        assert!(!tx.is_coinbase());
        tx.inputs.clear();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn output_total_detects_overflow() {
        let mut tx = sample();
        assert_eq!(tx.output_total(), Some(99));
        tx.outputs[0].value = i64::MAX;
        assert_eq!(tx.output_total(), None);
    }
}
