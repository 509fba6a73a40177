//! Chain linker: the single serialized entry point for every ledger mutation.
//!
//! Each submitted block is classified as an extension of the tip, a side
//! branch, a reorganization or an orphan. Every outcome that changes the
//! ledger is staged in one overlay and committed as one batch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ledgerd_params::constants::GENESIS_PREV_HASH;
use ledgerd_params::{hash256_to_hex, Hash256};
use ledgerd_primitives::{Block, Transaction};
use ledgerd_storage::staged::StagedStore;
use ledgerd_storage::{KeyValueStore, StoreError};

use crate::balance::BalanceCorrection;
use crate::blockstore::BlockStore;
use crate::error::ChainStateError;
use crate::index::{ChainIndex, ChainTip};
use crate::orphans::OrphanPool;
use crate::state::{beats_tip, ChainState, TxAdmission};
use crate::validation::validate_block;
use crate::wallet::WalletId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// Extended the canonical tip.
    Connected { height: u32 },
    /// Stored on a branch that does not beat the canonical tip.
    SideBranch { height: u32 },
    Reorganized {
        fork_height: u32,
        /// Former canonical blocks, tip first.
        disconnected: Vec<Hash256>,
        /// New canonical blocks, lowest first.
        connected: Vec<Hash256>,
    },
    /// Parent unknown; buffered.
    Orphaned,
    Duplicate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSubmission {
    pub hash: Hash256,
    pub outcome: SubmitOutcome,
    /// Buffered descendants processed because this block made their parent known.
    pub adopted: Vec<(Hash256, SubmitOutcome)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkerStatus {
    pub tip: Option<ChainTip>,
    pub orphan_count: usize,
    pub pending_count: usize,
    pub halted: Option<String>,
}

struct LinkerInner {
    orphans: OrphanPool,
    halted: Option<String>,
}

pub struct ChainLinker<S> {
    state: Arc<ChainState<S>>,
    inner: Mutex<LinkerInner>,
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

impl<S: KeyValueStore> ChainLinker<S> {
    pub fn new(state: Arc<ChainState<S>>) -> Self {
        let params = state.params();
        let orphans = OrphanPool::new(params.max_orphans, params.orphan_retention);
        Self {
            state,
            inner: Mutex::new(LinkerInner {
                orphans,
                halted: None,
            }),
        }
    }

    pub fn state(&self) -> &Arc<ChainState<S>> {
        &self.state
    }

    fn lock(&self) -> Result<MutexGuard<'_, LinkerInner>, ChainStateError> {
        self.inner
            .lock()
            .map_err(|_| ChainStateError::Store(StoreError::Poisoned("chain linker")))
    }

    fn lock_writable(&self) -> Result<MutexGuard<'_, LinkerInner>, ChainStateError> {
        let inner = self.lock()?;
        if let Some(reason) = &inner.halted {
            return Err(ChainStateError::Halted(reason.clone()));
        }
        Ok(inner)
    }

    fn is_indexed(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        Ok(ChainIndex::new(self.state.store()).get(hash)?.is_some())
    }

    fn note_failure(inner: &mut LinkerInner, err: &ChainStateError) {
        if err.halts_service() && inner.halted.is_none() {
            ledgerd_log::log_error!("halting ledger updates: {err}");
            inner.halted = Some(err.to_string());
        }
    }

    pub fn submit_block(&self, block: Block) -> Result<BlockSubmission, ChainStateError> {
        self.submit_block_at(block, Instant::now())
    }

    pub fn submit_block_at(
        &self,
        block: Block,
        now: Instant,
    ) -> Result<BlockSubmission, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let hash = block.hash();
        let result = self.process_block(&mut inner, hash, block, now);
        if let Err(err) = &result {
            Self::note_failure(&mut inner, err);
        }
        let adopted = match &result {
            Ok(SubmitOutcome::Orphaned) | Ok(SubmitOutcome::Duplicate) => Vec::new(),
            _ => match self.is_indexed(&hash) {
                Ok(true) => self.adopt_orphans(&mut inner, hash, now),
                Ok(false) => Vec::new(),
                Err(err) => {
                    ledgerd_log::log_error!(
                        "index lookup for {} failed; buffered children stay queued: {err}",
                        hash256_to_hex(&hash)
                    );
                    Self::note_failure(&mut inner, &err);
                    Vec::new()
                }
            },
        };
        result.map(|outcome| BlockSubmission {
            hash,
            outcome,
            adopted,
        })
    }

    /// Processes buffered blocks whose parent is now indexed, breadth first
    /// and in arrival order per parent.
    fn adopt_orphans(
        &self,
        inner: &mut LinkerInner,
        parent: Hash256,
        now: Instant,
    ) -> Vec<(Hash256, SubmitOutcome)> {
        let mut adopted = Vec::new();
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for orphan in inner.orphans.take_children(&parent) {
                if inner.halted.is_some() {
                    return adopted;
                }
                let hash = orphan.hash;
                match self.process_block(inner, hash, orphan.block, now) {
                    Ok(outcome) => {
                        ledgerd_log::log_debug!(
                            "adopted orphan {}: {outcome:?}",
                            hash256_to_hex(&hash)
                        );
                        adopted.push((hash, outcome));
                        queue.push_back(hash);
                    }
                    Err(err) => {
                        ledgerd_log::log_warn!(
                            "buffered block {} rejected: {err}",
                            hash256_to_hex(&hash)
                        );
                        Self::note_failure(inner, &err);
                        match self.is_indexed(&hash) {
                            Ok(true) => queue.push_back(hash),
                            Ok(false) => {}
                            Err(err) => {
                                ledgerd_log::log_error!(
                                    "index lookup for buffered block {} failed: {err}",
                                    hash256_to_hex(&hash)
                                );
                                Self::note_failure(inner, &err);
                                return adopted;
                            }
                        }
                    }
                }
            }
        }
        adopted
    }

    fn process_block(
        &self,
        inner: &mut LinkerInner,
        hash: Hash256,
        block: Block,
        now: Instant,
    ) -> Result<SubmitOutcome, ChainStateError> {
        let store = self.state.store();
        let index = ChainIndex::new(store);
        if inner.orphans.contains(&hash) || index.get(&hash)?.is_some() {
            return Ok(SubmitOutcome::Duplicate);
        }
        let header = &block.header;

        if header.height == 0 {
            if header.prev_hash != GENESIS_PREV_HASH {
                return Err(ChainStateError::InvalidBlock(
                    "genesis block must reference the zero hash",
                ));
            }
            if index.best_block()?.is_some() {
                return Err(ChainStateError::InvalidBlock("competing genesis block"));
            }
            return self.extend_tip(hash, &block);
        }

        let Some(parent) = index.get(&header.prev_hash)? else {
            let height = header.height;
            let prev_hash = header.prev_hash;
            for dropped in inner.orphans.insert(hash, block, now) {
                ledgerd_log::log_warn!(
                    "orphan buffer full; dropped block {} at height {}",
                    hash256_to_hex(&dropped.hash),
                    dropped.block.header.height
                );
            }
            ledgerd_log::log_debug!(
                "buffered orphan {} at height {height} awaiting {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&prev_hash)
            );
            return Ok(SubmitOutcome::Orphaned);
        };

        if parent.height.checked_add(1) != Some(header.height) {
            return Err(ChainStateError::ChainDiscontinuity(
                "block height does not follow its parent",
            ));
        }
        if parent.is_failed() {
            let view = StagedStore::new(store);
            self.state.store_block(&view, &hash, &block)?;
            self.state.mark_failed(&view, &hash)?;
            self.state.commit(&view.into_batch()?)?;
            return Err(ChainStateError::InvalidBlock(
                "block descends from a failed block",
            ));
        }

        let tip = index
            .best_block()?
            .ok_or(ChainStateError::CorruptIndex("indexed parent without a chain tip"))?;
        if tip.hash == header.prev_hash {
            return self.extend_tip(hash, &block);
        }

        if let Err(err) = validate_block(&block) {
            return self.reject_block(hash, &block, err);
        }
        let view = StagedStore::new(store);
        let entry = self.state.store_block(&view, &hash, &block)?;
        self.state.commit(&view.into_batch()?)?;
        if !beats_tip(self.state.params().fork_choice, &entry, &tip) {
            ledgerd_log::log_info!(
                "stored side branch block {} at height {}",
                hash256_to_hex(&hash),
                entry.height
            );
            return Ok(SubmitOutcome::SideBranch {
                height: entry.height,
            });
        }
        self.reorganize(&hash, &tip)
    }

    fn extend_tip(&self, hash: Hash256, block: &Block) -> Result<SubmitOutcome, ChainStateError> {
        let view = StagedStore::new(self.state.store());
        self.state.store_block(&view, &hash, block)?;
        let connected = match self.state.connect_block(&view, &hash, block) {
            Ok(connected) => connected,
            Err(err) if err.is_rejection() => return self.reject_block(hash, block, err),
            Err(err) => return Err(err),
        };
        if !connected.drift.is_empty() {
            self.state.reconcile_balances(&view)?;
        }
        self.state.commit(&view.into_batch()?)?;
        ledgerd_log::log_info!(
            "connected block {} at height {} ({} txs)",
            hash256_to_hex(&hash),
            connected.height,
            block.transaction_count()
        );
        Ok(SubmitOutcome::Connected {
            height: connected.height,
        })
    }

    /// Stores `block` as failed and wraps `err` in a rejection.
    fn reject_block(
        &self,
        hash: Hash256,
        block: &Block,
        err: ChainStateError,
    ) -> Result<SubmitOutcome, ChainStateError> {
        let view = StagedStore::new(self.state.store());
        self.state.store_block(&view, &hash, block)?;
        self.state.mark_failed(&view, &hash)?;
        self.state.commit(&view.into_batch()?)?;
        ledgerd_log::log_warn!(
            "rejected block {} at height {}: {err}",
            hash256_to_hex(&hash),
            block.header.height
        );
        Err(ChainStateError::LedgerInconsistency {
            block: hash,
            source: Box::new(err),
        })
    }

    fn reorganize(
        &self,
        new_tip: &Hash256,
        old_tip: &ChainTip,
    ) -> Result<SubmitOutcome, ChainStateError> {
        let store = self.state.store();
        let index = ChainIndex::new(store);
        let params = self.state.params();

        let mut branch = Vec::new();
        let mut cursor = *new_tip;
        let (fork_hash, fork_height) = loop {
            let entry = index
                .get(&cursor)?
                .ok_or(ChainStateError::CorruptIndex("branch block missing from index"))?;
            if entry.is_canonical() {
                break (cursor, entry.height);
            }
            branch.push(cursor);
            if entry.height == 0 {
                return Err(ChainStateError::ReorgFailure {
                    message: "branch does not join the canonical chain".to_string(),
                    branch_rejected: false,
                });
            }
            cursor = entry.prev_hash;
        };
        branch.reverse();

        let depth = old_tip.height.saturating_sub(fork_height);
        if let Some(limit) = params.max_reorg_depth {
            if depth > limit {
                return Err(ChainStateError::ReorgFailure {
                    message: format!("reorg depth {depth} exceeds limit {limit}"),
                    branch_rejected: false,
                });
            }
        }

        let view = StagedStore::new(store);
        let mut drifted = false;
        let mut disconnected = Vec::new();
        let mut released = Vec::new();
        let mut cursor = old_tip.hash;
        while cursor != fork_hash {
            let undone = self
                .state
                .disconnect_block(&view, &cursor)
                .map_err(|err| match err {
                    ChainStateError::CorruptIndex(_) => err,
                    other => ChainStateError::ReorgFailure {
                        message: format!(
                            "disconnect of {} failed: {other}",
                            hash256_to_hex(&cursor)
                        ),
                        branch_rejected: false,
                    },
                })?;
            drifted |= !undone.drift.is_empty();
            released.push(undone.reinstate_candidates);
            disconnected.push(cursor);
            cursor = index
                .get(&cursor)?
                .ok_or(ChainStateError::CorruptIndex("canonical block missing from index"))?
                .prev_hash;
        }

        let blocks = BlockStore::new(store);
        let mut connected = Vec::new();
        for (position, hash) in branch.iter().enumerate() {
            let block = blocks
                .get(hash)?
                .ok_or(ChainStateError::CorruptIndex("missing block data for branch"))?;
            match self.state.connect_block(&view, hash, &block) {
                Ok(done) => {
                    drifted |= !done.drift.is_empty();
                    connected.push(*hash);
                }
                Err(err) => {
                    drop(view);
                    let branch_rejected = err.is_rejection();
                    if branch_rejected {
                        let failed = StagedStore::new(store);
                        for bad in &branch[position..] {
                            self.state.mark_failed(&failed, bad)?;
                        }
                        self.state.commit(&failed.into_batch()?)?;
                        ledgerd_log::log_warn!(
                            "branch block {} rejected during replay; keeping tip {}",
                            hash256_to_hex(hash),
                            hash256_to_hex(&old_tip.hash)
                        );
                    }
                    return Err(ChainStateError::ReorgFailure {
                        message: format!(
                            "block {} failed to connect: {err}",
                            hash256_to_hex(hash)
                        ),
                        branch_rejected,
                    });
                }
            }
        }

        let evicted = self.state.revalidate_pending(&view)?;
        let candidates: Vec<Transaction> = released.into_iter().rev().flatten().collect();
        let reinstated =
            self.state
                .reinstate_pending(&view, candidates, unix_now().as_millis() as u64)?;
        if params.reconcile_after_reorg || drifted {
            self.state.reconcile_balances(&view)?;
        }
        self.state.commit(&view.into_batch()?)?;

        ledgerd_log::log_info!(
            "reorganized at height {fork_height}: disconnected {}, connected {}, reinstated {} pending, evicted {} pending",
            disconnected.len(),
            connected.len(),
            reinstated.len(),
            evicted.len()
        );
        Ok(SubmitOutcome::Reorganized {
            fork_height,
            disconnected,
            connected,
        })
    }

    pub fn expire_orphans(&self) -> Result<Vec<Hash256>, ChainStateError> {
        self.expire_orphans_at(Instant::now())
    }

    /// Drops buffered blocks whose retention window has passed.
    pub fn expire_orphans_at(&self, now: Instant) -> Result<Vec<Hash256>, ChainStateError> {
        let mut inner = self.lock()?;
        let expired = inner.orphans.expire(now);
        Ok(expired
            .into_iter()
            .map(|orphan| {
                ledgerd_log::log_warn!(
                    "orphan block {} at height {} expired waiting for {}",
                    hash256_to_hex(&orphan.hash),
                    orphan.block.header.height,
                    hash256_to_hex(&orphan.prev_hash())
                );
                orphan.hash
            })
            .collect())
    }

    pub fn expire_pending(&self) -> Result<Vec<Hash256>, ChainStateError> {
        self.expire_pending_at(unix_now())
    }

    /// Drops pending transactions received more than the retention window
    /// before `now`, given as time since the Unix epoch.
    pub fn expire_pending_at(&self, now: Duration) -> Result<Vec<Hash256>, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let cutoff = now
            .saturating_sub(self.state.params().pending_retention)
            .as_millis() as u64;
        let view = StagedStore::new(self.state.store());
        let result = self
            .state
            .expire_pending(&view, cutoff)
            .and_then(|expired| {
                self.state.commit(&view.into_batch()?)?;
                Ok(expired)
            });
        match &result {
            Ok(expired) => {
                for txid in expired {
                    ledgerd_log::log_info!("pending tx {} expired", hash256_to_hex(txid));
                }
            }
            Err(err) => Self::note_failure(&mut inner, err),
        }
        result
    }

    pub fn submit_transaction(&self, tx: &Transaction) -> Result<TxAdmission, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let view = StagedStore::new(self.state.store());
        let result = self
            .state
            .accept_transaction(&view, tx, unix_now().as_millis() as u64)
            .and_then(|admission| {
                self.state.commit(&view.into_batch()?)?;
                Ok(admission)
            });
        if let Err(err) = &result {
            Self::note_failure(&mut inner, err);
        }
        result
    }

    pub fn create_wallet(&self, name: &str) -> Result<WalletId, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let view = StagedStore::new(self.state.store());
        let result = self
            .state
            .create_wallet(&view, name, unix_now().as_secs())
            .and_then(|id| {
                self.state.commit(&view.into_batch()?)?;
                Ok(id)
            });
        if let Err(err) = &result {
            Self::note_failure(&mut inner, err);
        }
        result
    }

    pub fn register_address(
        &self,
        wallet: WalletId,
        address: &str,
        is_change: bool,
    ) -> Result<bool, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let view = StagedStore::new(self.state.store());
        let result = self
            .state
            .register_address(&view, wallet, address, is_change)
            .and_then(|added| {
                self.state.commit(&view.into_batch()?)?;
                Ok(added)
            });
        if let Err(err) = &result {
            Self::note_failure(&mut inner, err);
        }
        result
    }

    pub fn reconcile(&self) -> Result<Vec<BalanceCorrection>, ChainStateError> {
        let mut inner = self.lock_writable()?;
        let view = StagedStore::new(self.state.store());
        let result = self.state.reconcile_balances(&view).and_then(|corrections| {
            self.state.commit(&view.into_batch()?)?;
            Ok(corrections)
        });
        if let Err(err) = &result {
            Self::note_failure(&mut inner, err);
        }
        result
    }

    /// Clears a halt; returns the reason it was set.
    pub fn resume(&self) -> Result<Option<String>, ChainStateError> {
        let mut inner = self.lock()?;
        let reason = inner.halted.take();
        if let Some(reason) = &reason {
            ledgerd_log::log_info!("resuming ledger updates after halt: {reason}");
        }
        Ok(reason)
    }

    pub fn orphan_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.lock()?.orphans.len())
    }

    pub fn status(&self) -> Result<LinkerStatus, ChainStateError> {
        let inner = self.lock()?;
        Ok(LinkerStatus {
            tip: self.state.chain_tip()?,
            orphan_count: inner.orphans.len(),
            pending_count: self.state.pending_transactions()?.len(),
            halted: inner.halted.clone(),
        })
    }
}
