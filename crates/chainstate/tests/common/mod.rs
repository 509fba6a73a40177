#![allow(dead_code)]

use std::sync::Arc;

use ledgerd_chainstate::{ChainLinker, ChainState};
use ledgerd_params::money::Amount;
use ledgerd_params::{ledger_params, Hash256, LedgerParams, Network};
use ledgerd_primitives::{merkle_root, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::KeyValueStore;

pub const REWARD: Amount = 5_000;
pub const GENESIS_PREV: Hash256 = [0u8; 32];

pub fn regtest() -> LedgerParams {
    ledger_params(Network::Regtest)
}

pub fn linker_with(params: LedgerParams) -> ChainLinker<MemoryStore> {
    linker_on(Arc::new(MemoryStore::new()), params)
}

pub fn linker_on<S: KeyValueStore>(store: Arc<S>, params: LedgerParams) -> ChainLinker<S> {
    ChainLinker::new(Arc::new(ChainState::new(store, params)))
}

pub fn linker() -> ChainLinker<MemoryStore> {
    linker_with(regtest())
}

/// Coinbase paying `value` to `address` for the block at `height`.
pub fn coinbase(address: &str, value: Amount, height: u32) -> Transaction {
    Transaction {
        inputs: Vec::new(),
        outputs: vec![TxOut {
            value,
            address: address.to_string(),
        }],
        fee: 0,
        timestamp: 0,
        height,
    }
}

pub fn spend(inputs: &[OutPoint], outputs: &[(&str, Amount)], fee: Amount) -> Transaction {
    Transaction {
        inputs: inputs.iter().map(|prevout| TxIn { prevout: *prevout }).collect(),
        outputs: outputs
            .iter()
            .map(|(address, value)| TxOut {
                value: *value,
                address: address.to_string(),
            })
            .collect(),
        fee,
        timestamp: 1_700_000_000,
        height: 0,
    }
}

pub fn block_with(
    prev_hash: Hash256,
    height: u32,
    difficulty: u64,
    nonce: u64,
    transactions: Vec<Transaction>,
) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            prev_hash,
            height,
            timestamp: 1_700_000_000 + u64::from(height) * 60,
            nonce,
            difficulty,
            merkle_root: merkle_root(&txids),
            miner: "miner".to_string(),
            reward: REWARD,
        },
        transactions,
    }
}

/// Block whose only transaction is a coinbase to `address`. Competing
/// blocks at one height get distinct coinbases through their difficulty.
pub fn simple_block(prev_hash: Hash256, height: u32, difficulty: u64, address: &str) -> Block {
    let mut coinbase = coinbase(address, REWARD, height);
    coinbase.timestamp = difficulty;
    block_with(prev_hash, height, difficulty, 0, vec![coinbase])
}

pub fn genesis(address: &str) -> Block {
    simple_block(GENESIS_PREV, 0, 1, address)
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Submits `count` coinbase-only blocks on top of `prev`; returns them in order.
pub fn extend<S: KeyValueStore>(
    linker: &ChainLinker<S>,
    mut prev: Block,
    count: u32,
    difficulty: u64,
    address: &str,
) -> Vec<Block> {
    let mut out = Vec::new();
    for _ in 0..count {
        let next = simple_block(prev.hash(), prev.height() + 1, difficulty, address);
        linker.submit_block(next.clone()).expect("extend chain");
        out.push(next.clone());
        prev = next;
    }
    out
}
