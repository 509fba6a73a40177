mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use ledgerd_chainstate::{ChainStateError, SubmitOutcome};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_params::Hash256;
use ledgerd_storage::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp,
};

/// Memory store whose next `failures` batch writes fail, transiently unless
/// `hard` is set. Once a batch indexes `unreadable_block`, reads of that
/// index entry fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
    hard: AtomicBool,
    writes: AtomicU32,
    unreadable_block: Mutex<Option<Hash256>>,
    index_broken: AtomicBool,
}

impl FlakyStore {
    fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn is_unreadable(&self, key: &[u8]) -> bool {
        self.unreadable_block
            .lock()
            .expect("lock")
            .is_some_and(|hash| hash.as_slice() == key)
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if column == Column::BlockIndex
            && self.index_broken.load(Ordering::SeqCst)
            && self.is_unreadable(key)
        {
            return Err(StoreError::Backend("index read failed".to_string()));
        }
        self.inner.get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            if self.hard.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected".to_string()));
            }
            return Err(StoreError::Transient("injected".to_string()));
        }
        self.inner.write_batch(batch)?;
        let indexes_unreadable = batch.iter().any(|op| {
            matches!(op, WriteOp::Put { column: Column::BlockIndex, key, .. } if self.is_unreadable(key.as_slice()))
        });
        if indexes_unreadable {
            self.index_broken.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn transient_failures_within_budget_are_retried() {
    let store = Arc::new(FlakyStore::default());
    let mut params = regtest();
    params.commit_retries = 2;
    let linker = linker_on(Arc::clone(&store), params);

    store.fail_next(2);
    let genesis = genesis("alice");
    assert_eq!(
        linker.submit_block(genesis.clone()).expect("genesis").outcome,
        SubmitOutcome::Connected { height: 0 }
    );
    assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    assert_eq!(
        linker.state().chain_tip().expect("tip").expect("tip").hash,
        genesis.hash()
    );
}

#[test]
fn exhausted_retries_halt_until_resumed() {
    let store = Arc::new(FlakyStore::default());
    let linker = linker_on(Arc::clone(&store), regtest());

    store.fail_next(5);
    let genesis = genesis("alice");
    let err = linker.submit_block(genesis.clone()).expect_err("commit fails");
    assert!(matches!(err, ChainStateError::Store(StoreError::Transient(_))));
    assert!(linker.state().chain_tip().expect("tip").is_none());
    assert!(linker.status().expect("status").halted.is_some());
    assert!(matches!(
        linker.submit_block(genesis.clone()),
        Err(ChainStateError::Halted(_))
    ));

    store.fail_next(0);
    assert!(linker.resume().expect("resume").is_some());
    assert_eq!(
        linker.submit_block(genesis).expect("genesis").outcome,
        SubmitOutcome::Connected { height: 0 }
    );
}

#[test]
fn hard_store_failure_halts_without_retry() {
    let store = Arc::new(FlakyStore::default());
    let linker = linker_on(Arc::clone(&store), regtest());

    store.hard.store(true, Ordering::SeqCst);
    store.fail_next(1);
    let genesis = genesis("alice");
    let err = linker.submit_block(genesis.clone()).expect_err("commit fails");
    assert!(matches!(err, ChainStateError::Store(StoreError::Backend(_))));
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert!(linker.status().expect("status").halted.is_some());
    assert!(matches!(
        linker.create_wallet("alice"),
        Err(ChainStateError::Halted(_))
    ));

    linker.resume().expect("resume");
    assert_eq!(
        linker.submit_block(genesis).expect("genesis").outcome,
        SubmitOutcome::Connected { height: 0 }
    );
}

#[test]
fn index_read_failure_after_connect_halts_and_keeps_orphans() {
    let store = Arc::new(FlakyStore::default());
    let linker = linker_on(Arc::clone(&store), regtest());
    let genesis = genesis("alice");
    linker.submit_block(genesis.clone()).expect("genesis");

    let block1 = simple_block(genesis.hash(), 1, 1, "alice");
    let block2 = simple_block(block1.hash(), 2, 1, "alice");
    assert_eq!(
        linker.submit_block(block2).expect("orphan").outcome,
        SubmitOutcome::Orphaned
    );

    *store.unreadable_block.lock().expect("lock") = Some(block1.hash());
    let submission = linker.submit_block(block1).expect("block 1");
    assert_eq!(submission.outcome, SubmitOutcome::Connected { height: 1 });
    assert!(submission.adopted.is_empty());
    assert_eq!(linker.orphan_count().expect("orphans"), 1);
    assert!(matches!(
        linker.create_wallet("late"),
        Err(ChainStateError::Halted(_))
    ));
}
