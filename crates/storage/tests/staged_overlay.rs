use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::staged::StagedStore;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    batch.put(Column::Utxo, b"a1", b"base-a1");
    batch.put(Column::Utxo, b"a2", b"base-a2");
    batch.put(Column::Utxo, b"b1", b"base-b1");
    store.write_batch(&batch).expect("seed");
    store
}

#[test]
fn reads_see_staged_writes_without_touching_base() {
    let base = seeded();
    let staged = StagedStore::new(&base);

    let mut batch = WriteBatch::new();
    batch.delete(Column::Utxo, b"a1");
    batch.put(Column::Utxo, b"a3", b"staged-a3");
    batch.put(Column::Utxo, b"a2", b"staged-a2");
    staged.write_batch(&batch).expect("stage");

    assert_eq!(staged.get(Column::Utxo, b"a1").expect("get"), None);
    assert_eq!(
        staged.get(Column::Utxo, b"b1").expect("get"),
        Some(b"base-b1".to_vec())
    );
    let rows = staged.scan_prefix(Column::Utxo, b"a").expect("scan");
    assert_eq!(
        rows,
        vec![
            (b"a2".to_vec(), b"staged-a2".to_vec()),
            (b"a3".to_vec(), b"staged-a3".to_vec()),
        ]
    );

    assert_eq!(
        base.get(Column::Utxo, b"a1").expect("base get"),
        Some(b"base-a1".to_vec())
    );
    assert_eq!(base.get(Column::Utxo, b"a3").expect("base get"), None);
}

#[test]
fn into_batch_reproduces_final_state() {
    let base = seeded();
    let staged = StagedStore::new(&base);

    let mut first = WriteBatch::new();
    first.put(Column::Meta, b"tip", b"1");
    first.delete(Column::Utxo, b"a1");
    staged.write_batch(&first).expect("stage first");

    let mut second = WriteBatch::new();
    second.put(Column::Meta, b"tip", b"2");
    second.put(Column::Utxo, b"a1", b"restored");
    staged.write_batch(&second).expect("stage second");
    assert_eq!(staged.staged_len().expect("len"), 2);

    let batch = staged.into_batch().expect("collapse");
    assert_eq!(batch.len(), 2);
    base.write_batch(&batch).expect("commit");

    assert_eq!(
        base.get(Column::Meta, b"tip").expect("get"),
        Some(b"2".to_vec())
    );
    assert_eq!(
        base.get(Column::Utxo, b"a1").expect("get"),
        Some(b"restored".to_vec())
    );
}

#[test]
fn dropped_stage_leaves_base_untouched() {
    let base = seeded();
    {
        let staged = StagedStore::new(&base);
        let mut batch = WriteBatch::new();
        batch.delete(Column::Utxo, b"b1");
        staged.write_batch(&batch).expect("stage");
    }
    assert_eq!(
        base.get(Column::Utxo, b"b1").expect("get"),
        Some(b"base-b1".to_vec())
    );
}

#[test]
fn nested_stages_layer() {
    let base = seeded();
    let outer = StagedStore::new(&base);
    let mut batch = WriteBatch::new();
    batch.delete(Column::Utxo, b"a1");
    outer.write_batch(&batch).expect("outer");

    let inner = StagedStore::new(&outer);
    let mut batch = WriteBatch::new();
    batch.put(Column::Utxo, b"a4", b"inner");
    inner.write_batch(&batch).expect("inner");
    let keys: Vec<_> = inner
        .scan_prefix(Column::Utxo, b"a")
        .expect("scan")
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec![b"a2".to_vec(), b"a4".to_vec()]);

    outer
        .write_batch(&inner.into_batch().expect("inner batch"))
        .expect("fold");
    assert_eq!(
        outer.get(Column::Utxo, b"a4").expect("get"),
        Some(b"inner".to_vec())
    );
}
