//! Structural checks run before a block or pending transaction touches the
//! ledger. Cryptographic validation happens upstream.

use std::collections::HashSet;

use ledgerd_params::constants::{MAX_BLOCK_TRANSACTIONS, MAX_TX_IO};
use ledgerd_params::money::{checked_money_add, money_range, Amount};
use ledgerd_params::Hash256;
use ledgerd_primitives::{is_valid_address, Block, Transaction};

use crate::error::ChainStateError;

/// Checks block shape and returns the txids in block order.
pub fn validate_block(block: &Block) -> Result<Vec<Hash256>, ChainStateError> {
    if block.transactions.is_empty() {
        return Err(ChainStateError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    if block.transactions.len() > MAX_BLOCK_TRANSACTIONS {
        return Err(ChainStateError::InvalidBlock(
            "block transaction count too large",
        ));
    }
    if !money_range(block.header.reward) {
        return Err(ChainStateError::ValueOutOfRange);
    }
    if !is_valid_address(&block.header.miner) {
        return Err(ChainStateError::InvalidBlock("invalid miner address"));
    }

    let mut txids = Vec::with_capacity(block.transactions.len());
    let mut seen_txids = HashSet::with_capacity(block.transactions.len());
    let mut seen_inputs = HashSet::new();
    for (index, tx) in block.transactions.iter().enumerate() {
        if index == 0 {
            if !tx.is_coinbase() {
                return Err(ChainStateError::InvalidBlock(
                    "first transaction must be coinbase",
                ));
            }
            if tx.height != block.header.height {
                return Err(ChainStateError::InvalidBlock(
                    "coinbase height does not match block height",
                ));
            }
        } else if tx.is_coinbase() {
            return Err(ChainStateError::InvalidBlock(
                "coinbase transaction in non-first position",
            ));
        }
        validate_transaction_shape(tx)?;
        let txid = tx.txid();
        if !seen_txids.insert(txid) {
            return Err(ChainStateError::DuplicateTxid(txid));
        }
        for input in &tx.inputs {
            if !seen_inputs.insert(input.prevout) {
                return Err(ChainStateError::InvalidBlock(
                    "input spent twice within block",
                ));
            }
        }
        txids.push(txid);
    }
    Ok(txids)
}

/// Checks a standalone transaction offered to the pending pool.
pub fn validate_pending_transaction(tx: &Transaction) -> Result<(), ChainStateError> {
    if tx.is_coinbase() {
        return Err(ChainStateError::InvalidTransaction(
            "coinbase transaction outside a block",
        ));
    }
    validate_transaction_shape(tx)
}

fn validate_transaction_shape(tx: &Transaction) -> Result<(), ChainStateError> {
    if tx.outputs.is_empty() {
        return Err(ChainStateError::InvalidTransaction(
            "transaction has no outputs",
        ));
    }
    if tx.inputs.len() > MAX_TX_IO || tx.outputs.len() > MAX_TX_IO {
        return Err(ChainStateError::InvalidTransaction(
            "transaction has too many inputs or outputs",
        ));
    }
    if tx.is_coinbase() && tx.fee != 0 {
        return Err(ChainStateError::InvalidTransaction("coinbase declares a fee"));
    }
    if !tx.is_coinbase() && tx.height != 0 {
        return Err(ChainStateError::InvalidTransaction(
            "only a coinbase carries a block height",
        ));
    }
    if !money_range(tx.fee) {
        return Err(ChainStateError::ValueOutOfRange);
    }
    let mut total: Amount = 0;
    for output in &tx.outputs {
        if !money_range(output.value) {
            return Err(ChainStateError::ValueOutOfRange);
        }
        total = checked_money_add(total, output.value).ok_or(ChainStateError::ValueOutOfRange)?;
        if !is_valid_address(&output.address) {
            return Err(ChainStateError::InvalidTransaction("invalid output address"));
        }
    }
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ChainStateError::InvalidTransaction("duplicate input"));
        }
    }
    Ok(())
}
