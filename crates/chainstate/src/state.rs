//! Ledger state: connecting and disconnecting blocks, pending transactions,
//! wallets, and the read-side queries over all of them.
//!
//! Mutating methods take a `view` and write into it batch by batch, so later
//! transactions of a block see outputs created by earlier ones. Callers stage
//! the view (see [`ledgerd_storage::staged::StagedStore`]) and hand the final
//! batch to [`ChainState::commit`]; a failed step leaves the view dirty and it
//! must be dropped.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::thread;
use std::time::Duration;

use ledgerd_params::constants::{COMMIT_RETRY_BACKOFF_MS, GENESIS_PREV_HASH};
use ledgerd_params::money::{checked_money_add, Amount};
use ledgerd_params::{hash256_to_hex, ForkChoice, Hash256, LedgerParams};
use ledgerd_primitives::{address_key, is_valid_address, AddressKey, Block, OutPoint, Transaction};
use ledgerd_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use smallvec::SmallVec;

use crate::address_index::AddressIndex;
use crate::balance::{self, AddressDeltas, BalanceCorrection, BalanceDrift};
use crate::blockstore::BlockStore;
use crate::confirmations::{confirmations, TxPosition};
use crate::error::ChainStateError;
use crate::index::{BlockIndexEntry, ChainIndex, ChainTip};
use crate::pending::{PendingEntry, PendingPool};
use crate::spentindex::{SpentIndex, SpentRecord};
use crate::txindex::{TxIndex, TxLocation};
use crate::undo::{BlockUndo, SpentOutput, UndoStore};
use crate::utxo::{UtxoEntry, UtxoSet, UtxoStats};
use crate::validation::{validate_block, validate_pending_transaction};
use crate::wallet::{WalletAddress, WalletId, WalletRecord, WalletRegistry};

/// Net value per address moved by one transaction.
type TxAddressDeltas = SmallVec<[(AddressKey, Amount); 4]>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectedBlock {
    pub hash: Hash256,
    pub height: u32,
    /// Pending transactions dropped because the block spent their inputs.
    pub evicted_pending: Vec<Hash256>,
    pub drift: Vec<BalanceDrift>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisconnectedBlock {
    pub hash: Hash256,
    pub height: u32,
    /// Non-coinbase transactions of the block, in block order.
    pub reinstate_candidates: Vec<Transaction>,
    pub drift: Vec<BalanceDrift>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSummary {
    pub hash: Hash256,
    pub height: u32,
    pub prev_hash: Hash256,
    pub timestamp: u64,
    pub difficulty: u64,
    pub chainwork: [u8; 32],
    pub tx_count: u32,
    pub size: u32,
    pub canonical: bool,
    pub failed: bool,
}

/// An output as created by a canonical transaction, with its spend status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputRecord {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub address: String,
    pub height: u32,
    pub is_coinbase: bool,
    pub spent_by: Option<Hash256>,
}

impl OutputRecord {
    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub address: String,
    pub height: u32,
    pub is_coinbase: bool,
    pub mature: bool,
    pub confirmations: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletTx {
    pub txid: Hash256,
    /// `None` while pending.
    pub height: Option<u32>,
    pub delta: Amount,
    pub confirmations: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxAdmission {
    Accepted(Hash256),
    Duplicate(Hash256),
}

/// Whether `candidate` should replace `tip` under `fork_choice`. Ties keep the tip.
pub fn beats_tip(fork_choice: ForkChoice, candidate: &BlockIndexEntry, tip: &ChainTip) -> bool {
    match fork_choice {
        ForkChoice::CumulativeDifficulty => candidate.chainwork_value() > tip.chainwork_value(),
        ForkChoice::Height => candidate.height > tip.height,
    }
}

fn add_tx_delta(
    deltas: &mut TxAddressDeltas,
    key: AddressKey,
    value: Amount,
) -> Result<(), ChainStateError> {
    match deltas.iter_mut().find(|(existing, _)| *existing == key) {
        Some((_, slot)) => {
            *slot = slot
                .checked_add(value)
                .ok_or(ChainStateError::ValueOutOfRange)?;
        }
        None => deltas.push((key, value)),
    }
    Ok(())
}

fn poisoned_gate() -> ChainStateError {
    ChainStateError::Store(StoreError::Poisoned("chain state gate"))
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: LedgerParams,
    gate: RwLock<()>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(store: Arc<S>, params: LedgerParams) -> Self {
        Self {
            store,
            params,
            gate: RwLock::new(()),
        }
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    /// Committed state, for staging views. Readers should use the query methods.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn read_gate(&self) -> Result<RwLockReadGuard<'_, ()>, ChainStateError> {
        self.gate.read().map_err(|_| poisoned_gate())
    }

    /// Writes `batch` atomically, retrying transient store failures with a
    /// linear backoff.
    pub fn commit(&self, batch: &WriteBatch) -> Result<(), ChainStateError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.gate.write().map_err(|_| poisoned_gate())?;
        let retries = self.params.commit_retries;
        let mut attempt = 0u32;
        loop {
            match self.store.write_batch(batch) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < retries => {
                    attempt += 1;
                    ledgerd_log::log_warn!(
                        "commit of {} ops failed ({err}); retry {attempt}/{retries}",
                        batch.len()
                    );
                    thread::sleep(Duration::from_millis(
                        COMMIT_RETRY_BACKOFF_MS.saturating_mul(u64::from(attempt)),
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Stores block data and its index entry without touching the chain.
    pub fn store_block<V: KeyValueStore>(
        &self,
        view: &V,
        hash: &Hash256,
        block: &Block,
    ) -> Result<BlockIndexEntry, ChainStateError> {
        let index = ChainIndex::new(view);
        let parent_work = if block.header.height == 0 {
            U256::zero()
        } else {
            index
                .get(&block.header.prev_hash)?
                .ok_or(ChainStateError::ChainDiscontinuity(
                    "parent block is not indexed",
                ))?
                .chainwork_value()
        };
        let entry = BlockIndexEntry::from_header(
            &block.header,
            parent_work,
            block.transaction_count(),
            block.size(),
        );
        let mut batch = WriteBatch::new();
        BlockStore::new(view).put(&mut batch, hash, block);
        index.put(&mut batch, hash, &entry);
        view.write_batch(&batch)?;
        Ok(entry)
    }

    pub fn mark_failed<V: KeyValueStore>(
        &self,
        view: &V,
        hash: &Hash256,
    ) -> Result<(), ChainStateError> {
        let index = ChainIndex::new(view);
        let Some(mut entry) = index.get(hash)? else {
            return Ok(());
        };
        entry.mark_failed();
        let mut batch = WriteBatch::new();
        index.put(&mut batch, hash, &entry);
        view.write_batch(&batch)?;
        Ok(())
    }

    /// Applies `block` on top of the view's tip. The block must already be
    /// stored with [`ChainState::store_block`].
    pub fn connect_block<V: KeyValueStore>(
        &self,
        view: &V,
        hash: &Hash256,
        block: &Block,
    ) -> Result<ConnectedBlock, ChainStateError> {
        let index = ChainIndex::new(view);
        let mut entry = index
            .get(hash)?
            .ok_or(ChainStateError::CorruptIndex("connect of unindexed block"))?;
        let height = block.header.height;
        let extends_tip = match index.best_block()? {
            None => height == 0 && block.header.prev_hash == GENESIS_PREV_HASH,
            Some(tip) => {
                tip.hash == block.header.prev_hash && tip.height.checked_add(1) == Some(height)
            }
        };
        if !extends_tip {
            return Err(ChainStateError::ChainDiscontinuity(
                "block does not extend the current tip",
            ));
        }
        let txids = validate_block(block)?;

        let utxos = UtxoSet::new(view);
        let spent_index = SpentIndex::new(view);
        let tx_index = TxIndex::new(view);
        let address_index = AddressIndex::new(view);
        let pending = PendingPool::new(view);

        for txid in &txids {
            if tx_index.get(txid)?.is_some() {
                return Err(ChainStateError::DuplicateTxid(*txid));
            }
        }

        let mut stats = utxos.stats()?;
        let mut undo = BlockUndo::default();
        let mut deltas = AddressDeltas::new();
        let mut fees: Amount = 0;
        let mut coinbase_total: Amount = 0;
        let mut evicted_pending = Vec::new();

        for (position, (tx, txid)) in block.transactions.iter().zip(&txids).enumerate() {
            let mut batch = WriteBatch::new();
            let mut touched = TxAddressDeltas::new();
            let is_coinbase = tx.is_coinbase();

            let mut input_total: Amount = 0;
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let outpoint = input.prevout;
                let Some(spent) = utxos.get(&outpoint)? else {
                    return Err(ChainStateError::DanglingInput {
                        outpoint,
                        spent_by: spent_index.get(&outpoint)?.map(|record| record.txid),
                    });
                };
                if !spent.is_mature_at(height, self.params.coinbase_maturity) {
                    return Err(ChainStateError::ImmatureSpend {
                        outpoint,
                        created_height: spent.height,
                        spend_height: height,
                    });
                }
                input_total = checked_money_add(input_total, spent.value)
                    .ok_or(ChainStateError::ValueOutOfRange)?;
                utxos.delete(&mut batch, &outpoint);
                address_index.delete_outpoint(&mut batch, &spent.address, &outpoint);
                spent_index.insert(
                    &mut batch,
                    &outpoint,
                    SpentRecord {
                        txid: *txid,
                        input_index: input_index as u32,
                        height,
                    },
                );
                stats.remove(&spent)?;
                deltas.debit(&spent.address, spent.value)?;
                add_tx_delta(&mut touched, address_key(&spent.address), -spent.value)?;
                undo.spent.push(SpentOutput {
                    outpoint,
                    entry: spent,
                });
            }

            let output_total = tx.output_total().ok_or(ChainStateError::ValueOutOfRange)?;
            if is_coinbase {
                coinbase_total = output_total;
            } else {
                let required = checked_money_add(output_total, tx.fee)
                    .ok_or(ChainStateError::ValueOutOfRange)?;
                if required > input_total {
                    return Err(ChainStateError::ValueOutOfRange);
                }
                fees = checked_money_add(fees, tx.fee).ok_or(ChainStateError::ValueOutOfRange)?;
            }

            for (output_index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, output_index as u32);
                let created = UtxoEntry {
                    value: output.value,
                    address: output.address.clone(),
                    height,
                    is_coinbase,
                };
                utxos.put(&mut batch, &outpoint, &created);
                address_index.insert_outpoint(&mut batch, &output.address, &outpoint);
                stats.add(&created)?;
                deltas.credit(&output.address, output.value)?;
                add_tx_delta(&mut touched, address_key(&output.address), output.value)?;
            }

            tx_index.insert(
                &mut batch,
                txid,
                TxLocation {
                    block_hash: *hash,
                    height,
                    index: position as u32,
                },
            );
            for (key, delta) in &touched {
                address_index.put_tx(&mut batch, key, height, txid, *delta);
            }
            if !is_coinbase {
                evicted_pending.extend(pending.settle(&mut batch, txid, tx)?);
            }
            view.write_batch(&batch)?;
        }

        let coinbase_limit = checked_money_add(block.header.reward, fees)
            .ok_or(ChainStateError::ValueOutOfRange)?;
        if coinbase_total > coinbase_limit {
            return Err(ChainStateError::ValueOutOfRange);
        }

        let mut batch = WriteBatch::new();
        UndoStore::new(view).put(&mut batch, hash, &undo);
        utxos.put_stats(&mut batch, &stats);
        entry.set_canonical(true);
        index.put(&mut batch, hash, &entry);
        index.set_height_hash(&mut batch, height, hash);
        index.set_best_block(&mut batch, hash);
        let drift = balance::project(view, &deltas, &mut batch)?;
        view.write_batch(&batch)?;

        for txid in &evicted_pending {
            ledgerd_log::log_info!(
                "evicted pending tx {} conflicting with block {}",
                hash256_to_hex(txid),
                height
            );
        }
        Ok(ConnectedBlock {
            hash: *hash,
            height,
            evicted_pending,
            drift,
        })
    }

    /// Unwinds the view's tip block using its undo record.
    pub fn disconnect_block<V: KeyValueStore>(
        &self,
        view: &V,
        hash: &Hash256,
    ) -> Result<DisconnectedBlock, ChainStateError> {
        let index = ChainIndex::new(view);
        let tip = index
            .best_block()?
            .ok_or(ChainStateError::ChainDiscontinuity("no tip to disconnect"))?;
        if tip.hash != *hash {
            return Err(ChainStateError::ChainDiscontinuity(
                "block is not the current tip",
            ));
        }
        let mut entry = index
            .get(hash)?
            .ok_or(ChainStateError::CorruptIndex("tip missing from block index"))?;
        let block = BlockStore::new(view)
            .get(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block data for tip"))?;
        let undo_store = UndoStore::new(view);
        let mut undo = undo_store
            .get(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block undo for tip"))?;
        let height = entry.height;

        let utxos = UtxoSet::new(view);
        let spent_index = SpentIndex::new(view);
        let tx_index = TxIndex::new(view);
        let address_index = AddressIndex::new(view);

        let mut stats = utxos.stats()?;
        let mut deltas = AddressDeltas::new();
        let mut reinstate_candidates = Vec::new();

        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            let mut batch = WriteBatch::new();
            let mut touched: SmallVec<[AddressKey; 4]> = SmallVec::new();

            for output_index in (0..tx.outputs.len()).rev() {
                let outpoint = OutPoint::new(txid, output_index as u32);
                let created = utxos.get(&outpoint)?.ok_or(ChainStateError::CorruptIndex(
                    "output of disconnected block is missing",
                ))?;
                utxos.delete(&mut batch, &outpoint);
                address_index.delete_outpoint(&mut batch, &created.address, &outpoint);
                stats.remove(&created)?;
                deltas.debit(&created.address, created.value)?;
                let key = address_key(&created.address);
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }

            for input in tx.inputs.iter().rev() {
                let restored = undo
                    .spent
                    .pop()
                    .ok_or(ChainStateError::CorruptIndex("block undo is short"))?;
                if restored.outpoint != input.prevout {
                    return Err(ChainStateError::CorruptIndex(
                        "block undo does not match inputs",
                    ));
                }
                utxos.put(&mut batch, &restored.outpoint, &restored.entry);
                address_index.insert_outpoint(
                    &mut batch,
                    &restored.entry.address,
                    &restored.outpoint,
                );
                spent_index.delete(&mut batch, &restored.outpoint);
                stats.add(&restored.entry)?;
                deltas.credit(&restored.entry.address, restored.entry.value)?;
                let key = address_key(&restored.entry.address);
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }

            tx_index.delete(&mut batch, &txid);
            for key in &touched {
                address_index.delete_tx(&mut batch, key, height, &txid);
            }
            view.write_batch(&batch)?;
            if !tx.is_coinbase() {
                reinstate_candidates.push(tx.clone());
            }
        }
        if !undo.spent.is_empty() {
            return Err(ChainStateError::CorruptIndex(
                "block undo has unmatched entries",
            ));
        }
        reinstate_candidates.reverse();

        let mut batch = WriteBatch::new();
        undo_store.delete(&mut batch, hash);
        utxos.put_stats(&mut batch, &stats);
        entry.set_canonical(false);
        index.put(&mut batch, hash, &entry);
        index.clear_height_hash(&mut batch, height);
        if height == 0 {
            index.clear_best_block(&mut batch);
        } else {
            index.set_best_block(&mut batch, &entry.prev_hash);
        }
        let drift = balance::project(view, &deltas, &mut batch)?;
        view.write_batch(&batch)?;

        Ok(DisconnectedBlock {
            hash: *hash,
            height,
            reinstate_candidates,
            drift,
        })
    }

    /// Checks that every input of `tx` is spendable by the next block and not
    /// claimed by a pending transaction. Returns the input total.
    fn pending_input_total<V: KeyValueStore>(
        &self,
        view: &V,
        tx: &Transaction,
    ) -> Result<Amount, ChainStateError> {
        let utxos = UtxoSet::new(view);
        let spent_index = SpentIndex::new(view);
        let pending = PendingPool::new(view);
        let spend_height = match ChainIndex::new(view).best_block()? {
            Some(tip) => tip.height.saturating_add(1),
            None => 0,
        };
        let mut total: Amount = 0;
        for input in &tx.inputs {
            let outpoint = input.prevout;
            let Some(entry) = utxos.get(&outpoint)? else {
                return Err(ChainStateError::DanglingInput {
                    outpoint,
                    spent_by: spent_index.get(&outpoint)?.map(|record| record.txid),
                });
            };
            if let Some(claimed_by) = pending.claimant(&outpoint)? {
                return Err(ChainStateError::PendingConflict {
                    outpoint,
                    claimed_by,
                });
            }
            if !entry.is_mature_at(spend_height, self.params.coinbase_maturity) {
                return Err(ChainStateError::ImmatureSpend {
                    outpoint,
                    created_height: entry.height,
                    spend_height,
                });
            }
            total = checked_money_add(total, entry.value).ok_or(ChainStateError::ValueOutOfRange)?;
        }
        Ok(total)
    }

    /// Admits `tx` to the pending pool.
    pub fn accept_transaction<V: KeyValueStore>(
        &self,
        view: &V,
        tx: &Transaction,
        received_at: u64,
    ) -> Result<TxAdmission, ChainStateError> {
        validate_pending_transaction(tx)?;
        let txid = tx.txid();
        let pending = PendingPool::new(view);
        if pending.contains(&txid)? || TxIndex::new(view).get(&txid)?.is_some() {
            return Ok(TxAdmission::Duplicate(txid));
        }
        let limit = self.params.max_pending;
        if pending.len()? >= limit {
            return Err(ChainStateError::PendingPoolFull { limit });
        }
        let input_total = self.pending_input_total(view, tx)?;
        let output_total = tx.output_total().ok_or(ChainStateError::ValueOutOfRange)?;
        let required =
            checked_money_add(output_total, tx.fee).ok_or(ChainStateError::ValueOutOfRange)?;
        if required > input_total {
            return Err(ChainStateError::ValueOutOfRange);
        }
        let entry = PendingEntry {
            txid,
            seq: pending.next_seq()?,
            received_at,
            tx: tx.clone(),
        };
        let mut batch = WriteBatch::new();
        pending.insert(&mut batch, &entry);
        view.write_batch(&batch)?;
        Ok(TxAdmission::Accepted(txid))
    }

    /// Returns transactions released by disconnected blocks to the pending
    /// pool when they are still spendable against the view. Returns the
    /// reinstated txids.
    pub fn reinstate_pending<V: KeyValueStore>(
        &self,
        view: &V,
        candidates: Vec<Transaction>,
        received_at: u64,
    ) -> Result<Vec<Hash256>, ChainStateError> {
        let mut reinstated = Vec::new();
        for tx in candidates {
            match self.accept_transaction(view, &tx, received_at) {
                Ok(TxAdmission::Accepted(txid)) => reinstated.push(txid),
                Ok(TxAdmission::Duplicate(_)) => {}
                Err(err)
                    if err.is_rejection()
                        || matches!(
                            err,
                            ChainStateError::PendingConflict { .. }
                                | ChainStateError::PendingPoolFull { .. }
                        ) =>
                {
                    ledgerd_log::log_debug!(
                        "dropping released tx {}: {err}",
                        hash256_to_hex(&tx.txid())
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(reinstated)
    }

    /// Drops pending transactions the view can no longer spend: an input
    /// that is missing or spent, an immature coinbase input, or inputs that
    /// no longer cover outputs plus fee. Returns the evicted txids.
    pub fn revalidate_pending<V: KeyValueStore>(
        &self,
        view: &V,
    ) -> Result<Vec<Hash256>, ChainStateError> {
        let pending = PendingPool::new(view);
        let utxos = UtxoSet::new(view);
        let spend_height = match ChainIndex::new(view).best_block()? {
            Some(tip) => tip.height.saturating_add(1),
            None => 0,
        };
        let maturity = self.params.coinbase_maturity;
        let mut batch = WriteBatch::new();
        let mut evicted = Vec::new();
        for entry in pending.all()? {
            let mut failure = None;
            let mut input_total: Amount = 0;
            for input in &entry.tx.inputs {
                match utxos.get(&input.prevout)? {
                    Some(utxo) if !utxo.is_mature_at(spend_height, maturity) => {
                        failure = Some("immature coinbase input");
                    }
                    Some(utxo) => match checked_money_add(input_total, utxo.value) {
                        Some(total) => input_total = total,
                        None => failure = Some("input total out of range"),
                    },
                    None => failure = Some("input is missing or spent"),
                }
                if failure.is_some() {
                    break;
                }
            }
            if failure.is_none() {
                let required = entry
                    .tx
                    .output_total()
                    .and_then(|outputs| checked_money_add(outputs, entry.tx.fee));
                if required.map_or(true, |required| required > input_total) {
                    failure = Some("inputs no longer cover outputs and fee");
                }
            }
            if let Some(reason) = failure {
                ledgerd_log::log_debug!(
                    "evicting pending tx {}: {reason}",
                    hash256_to_hex(&entry.txid)
                );
                pending.remove(&mut batch, &entry);
                evicted.push(entry.txid);
            }
        }
        view.write_batch(&batch)?;
        Ok(evicted)
    }

    /// Drops pending transactions received before `cutoff_ms`. Returns the
    /// expired txids.
    pub fn expire_pending<V: KeyValueStore>(
        &self,
        view: &V,
        cutoff_ms: u64,
    ) -> Result<Vec<Hash256>, ChainStateError> {
        let pending = PendingPool::new(view);
        let mut batch = WriteBatch::new();
        let mut expired = Vec::new();
        for entry in pending.all()? {
            if entry.received_at < cutoff_ms {
                pending.remove(&mut batch, &entry);
                expired.push(entry.txid);
            }
        }
        view.write_batch(&batch)?;
        Ok(expired)
    }

    pub fn create_wallet<V: KeyValueStore>(
        &self,
        view: &V,
        name: &str,
        created_at: u64,
    ) -> Result<WalletId, ChainStateError> {
        let registry = WalletRegistry::new(view);
        let id = registry.next_id()?;
        let mut batch = WriteBatch::new();
        registry.create(
            &mut batch,
            &WalletRecord {
                id,
                name: name.to_string(),
                created_at,
            },
        );
        view.write_batch(&batch)?;
        Ok(id)
    }

    /// Assigns `address` to `wallet` and folds its current unspent value into
    /// the cached balance. Returns false when the wallet already owned it.
    pub fn register_address<V: KeyValueStore>(
        &self,
        view: &V,
        wallet: WalletId,
        address: &str,
        is_change: bool,
    ) -> Result<bool, ChainStateError> {
        if !is_valid_address(address) {
            return Err(ChainStateError::InvalidAddress(address.to_string()));
        }
        let registry = WalletRegistry::new(view);
        registry.require(wallet)?;
        if let Some(owner) = registry.owner(address)? {
            if owner.wallet == wallet {
                return Ok(false);
            }
            return Err(ChainStateError::AddressInUse {
                address: address.to_string(),
                wallet: owner.wallet,
            });
        }

        let utxos = UtxoSet::new(view);
        let mut existing: Amount = 0;
        for outpoint in AddressIndex::new(view).outpoints(address)? {
            let entry = utxos.get(&outpoint)?.ok_or(ChainStateError::CorruptIndex(
                "address index points at missing utxo",
            ))?;
            existing = existing
                .checked_add(entry.value)
                .ok_or(ChainStateError::ValueOutOfRange)?;
        }
        let balance = registry
            .balance(wallet)?
            .unwrap_or(0)
            .checked_add(existing)
            .ok_or(ChainStateError::ValueOutOfRange)?;

        let mut batch = WriteBatch::new();
        registry.add_address(
            &mut batch,
            &WalletAddress {
                wallet,
                address: address.to_string(),
                is_change,
            },
        );
        registry.set_balance(&mut batch, wallet, balance);
        view.write_batch(&batch)?;
        Ok(true)
    }

    pub fn reconcile_balances<V: KeyValueStore>(
        &self,
        view: &V,
    ) -> Result<Vec<BalanceCorrection>, ChainStateError> {
        let mut batch = WriteBatch::new();
        let corrections = balance::reconcile(view, &mut batch)?;
        view.write_batch(&batch)?;
        for correction in &corrections {
            ledgerd_log::log_warn!(
                "wallet {} balance corrected from {} to {}",
                correction.wallet,
                correction.cached,
                correction.actual
            );
        }
        Ok(corrections)
    }

    pub fn chain_tip(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let _guard = self.read_gate()?;
        ChainIndex::new(self.store()).best_block()
    }

    pub fn block_entry(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, ChainStateError> {
        ChainIndex::new(self.store()).get(hash)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        BlockStore::new(self.store()).get(hash)
    }

    /// Canonical block at `height`.
    pub fn block_at_height(&self, height: u32) -> Result<Option<Block>, ChainStateError> {
        let _guard = self.read_gate()?;
        let Some(hash) = ChainIndex::new(self.store()).height_hash(height)? else {
            return Ok(None);
        };
        BlockStore::new(self.store()).get(&hash)
    }

    pub fn block_summary(&self, hash: &Hash256) -> Result<Option<BlockSummary>, ChainStateError> {
        let Some(entry) = ChainIndex::new(self.store()).get(hash)? else {
            return Ok(None);
        };
        Ok(Some(BlockSummary {
            hash: *hash,
            height: entry.height,
            prev_hash: entry.prev_hash,
            timestamp: entry.timestamp,
            difficulty: entry.difficulty,
            chainwork: entry.chainwork,
            tx_count: entry.tx_count,
            size: entry.size,
            canonical: entry.is_canonical(),
            failed: entry.is_failed(),
        }))
    }

    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, ChainStateError> {
        let _guard = self.read_gate()?;
        let store = self.store();
        if let Some(entry) = UtxoSet::new(store).get(outpoint)? {
            return Ok(Some(OutputRecord {
                outpoint: *outpoint,
                value: entry.value,
                address: entry.address,
                height: entry.height,
                is_coinbase: entry.is_coinbase,
                spent_by: None,
            }));
        }
        let Some(location) = TxIndex::new(store).get(&outpoint.txid)? else {
            return Ok(None);
        };
        let tx = BlockStore::new(store)
            .transaction(&location.block_hash, location.index)?
            .ok_or(ChainStateError::CorruptIndex(
                "tx index points at missing block data",
            ))?;
        let Some(output) = tx.outputs.get(outpoint.index as usize) else {
            return Ok(None);
        };
        Ok(Some(OutputRecord {
            outpoint: *outpoint,
            value: output.value,
            address: output.address.clone(),
            height: location.height,
            is_coinbase: tx.is_coinbase(),
            spent_by: SpentIndex::new(store).get(outpoint)?.map(|record| record.txid),
        }))
    }

    pub fn utxo_stats(&self) -> Result<UtxoStats, ChainStateError> {
        UtxoSet::new(self.store()).stats()
    }

    /// Recomputes the unspent totals from a full scan.
    pub fn compute_utxo_stats(&self) -> Result<UtxoStats, ChainStateError> {
        let _guard = self.read_gate()?;
        let mut stats = UtxoStats::default();
        for (_, entry) in UtxoSet::new(self.store()).all()? {
            stats.add(&entry)?;
        }
        Ok(stats)
    }

    fn tx_position(&self, txid: &Hash256) -> Result<TxPosition, ChainStateError> {
        if let Some(location) = TxIndex::new(self.store()).get(txid)? {
            return Ok(TxPosition::Confirmed {
                height: location.height,
            });
        }
        if PendingPool::new(self.store()).contains(txid)? {
            return Ok(TxPosition::Pending);
        }
        Ok(TxPosition::Unknown)
    }

    pub fn confirmations(&self, txid: &Hash256) -> Result<Option<u32>, ChainStateError> {
        let _guard = self.read_gate()?;
        let tip = ChainIndex::new(self.store()).best_block()?;
        let position = self.tx_position(txid)?;
        Ok(confirmations(tip.map(|tip| tip.height), position))
    }

    pub fn wallets(&self) -> Result<Vec<WalletRecord>, ChainStateError> {
        WalletRegistry::new(self.store()).all()
    }

    pub fn balance(&self, wallet: WalletId) -> Result<Amount, ChainStateError> {
        let _guard = self.read_gate()?;
        let registry = WalletRegistry::new(self.store());
        registry.require(wallet)?;
        Ok(registry.balance(wallet)?.unwrap_or(0))
    }

    pub fn wallet_addresses(&self, wallet: WalletId) -> Result<Vec<WalletAddress>, ChainStateError> {
        let _guard = self.read_gate()?;
        let registry = WalletRegistry::new(self.store());
        registry.require(wallet)?;
        registry.addresses(wallet)
    }

    /// Unspent outputs owned by `wallet`, ordered by height then outpoint.
    pub fn list_utxos(&self, wallet: WalletId) -> Result<Vec<WalletUtxo>, ChainStateError> {
        let _guard = self.read_gate()?;
        let store = self.store();
        let registry = WalletRegistry::new(store);
        registry.require(wallet)?;
        let tip_height = ChainIndex::new(store).best_block()?.map(|tip| tip.height);
        let spend_height = tip_height.map_or(0, |height| height.saturating_add(1));
        let utxos = UtxoSet::new(store);
        let address_index = AddressIndex::new(store);

        let mut out = Vec::new();
        for owned in registry.addresses(wallet)? {
            for outpoint in address_index.outpoints(&owned.address)? {
                let entry = utxos.get(&outpoint)?.ok_or(ChainStateError::CorruptIndex(
                    "address index points at missing utxo",
                ))?;
                out.push(WalletUtxo {
                    outpoint,
                    mature: entry.is_mature_at(spend_height, self.params.coinbase_maturity),
                    confirmations: confirmations(
                        tip_height,
                        TxPosition::Confirmed {
                            height: entry.height,
                        },
                    )
                    .unwrap_or(0),
                    value: entry.value,
                    address: entry.address,
                    height: entry.height,
                    is_coinbase: entry.is_coinbase,
                });
            }
        }
        out.sort_by(|a, b| (a.height, a.outpoint).cmp(&(b.height, b.outpoint)));
        Ok(out)
    }

    /// Transactions that moved value into or out of `wallet`: confirmed ones
    /// by height, then pending ones in arrival order.
    pub fn wallet_history(&self, wallet: WalletId) -> Result<Vec<WalletTx>, ChainStateError> {
        let _guard = self.read_gate()?;
        let store = self.store();
        let registry = WalletRegistry::new(store);
        registry.require(wallet)?;
        let addresses = registry.addresses(wallet)?;
        let tip_height = ChainIndex::new(store).best_block()?.map(|tip| tip.height);
        let address_index = AddressIndex::new(store);

        let mut confirmed: BTreeMap<(u32, Hash256), Amount> = BTreeMap::new();
        for owned in &addresses {
            for entry in address_index.txs(&owned.address)? {
                let slot = confirmed.entry((entry.height, entry.txid)).or_insert(0);
                *slot = slot
                    .checked_add(entry.delta)
                    .ok_or(ChainStateError::ValueOutOfRange)?;
            }
        }
        let mut out: Vec<WalletTx> = confirmed
            .into_iter()
            .map(|((height, txid), delta)| WalletTx {
                txid,
                height: Some(height),
                delta,
                confirmations: confirmations(tip_height, TxPosition::Confirmed { height })
                    .unwrap_or(0),
            })
            .collect();

        let owned: HashSet<AddressKey> = addresses
            .iter()
            .map(|owned| address_key(&owned.address))
            .collect();
        let utxos = UtxoSet::new(store);
        for entry in PendingPool::new(store).all()? {
            let mut delta: Amount = 0;
            let mut touched = false;
            for output in &entry.tx.outputs {
                if owned.contains(&address_key(&output.address)) {
                    delta = delta
                        .checked_add(output.value)
                        .ok_or(ChainStateError::ValueOutOfRange)?;
                    touched = true;
                }
            }
            for input in &entry.tx.inputs {
                if let Some(spent) = utxos.get(&input.prevout)? {
                    if owned.contains(&address_key(&spent.address)) {
                        delta = delta
                            .checked_sub(spent.value)
                            .ok_or(ChainStateError::ValueOutOfRange)?;
                        touched = true;
                    }
                }
            }
            if touched {
                out.push(WalletTx {
                    txid: entry.txid,
                    height: None,
                    delta,
                    confirmations: 0,
                });
            }
        }
        Ok(out)
    }

    pub fn pending_transactions(&self) -> Result<Vec<PendingEntry>, ChainStateError> {
        let _guard = self.read_gate()?;
        PendingPool::new(self.store()).all()
    }
}
