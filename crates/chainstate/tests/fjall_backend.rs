mod common;

use std::sync::Arc;

use common::*;
use ledgerd_chainstate::SubmitOutcome;
use ledgerd_storage::fjall::FjallStore;

#[test]
fn ledger_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    let (wallet, tip_hash, payment) = {
        let store = Arc::new(FjallStore::open(dir.path()).expect("open"));
        let linker = linker_on(Arc::clone(&store), regtest());
        let wallet = linker.create_wallet("bob").expect("wallet");
        linker.register_address(wallet, "bob", false).expect("register");

        let genesis = genesis("alice");
        linker.submit_block(genesis.clone()).expect("genesis");
        let payment = spend(&[coinbase_outpoint(&genesis)], &[("bob", 4_000)], 1_000);
        let block1 = block_with(
            genesis.hash(),
            1,
            1,
            0,
            vec![coinbase("miner", REWARD + 1_000, 1), payment.clone()],
        );
        assert_eq!(
            linker.submit_block(block1.clone()).expect("block 1").outcome,
            SubmitOutcome::Connected { height: 1 }
        );
        store.flush().expect("flush");
        (wallet, block1.hash(), payment)
    };

    let store = Arc::new(FjallStore::open(dir.path()).expect("reopen"));
    let linker = linker_on(store, regtest());
    let state = linker.state();
    let tip = state.chain_tip().expect("tip").expect("tip");
    assert_eq!(tip.hash, tip_hash);
    assert_eq!(tip.height, 1);
    assert_eq!(state.balance(wallet).expect("balance"), 4_000);
    assert_eq!(state.confirmations(&payment.txid()).expect("conf"), Some(1));
    assert_eq!(state.utxo_stats().expect("stats"), state.compute_utxo_stats().expect("scan"));

    let next = simple_block(tip_hash, 2, 1, "bob");
    assert_eq!(
        linker.submit_block(next).expect("block 2").outcome,
        SubmitOutcome::Connected { height: 2 }
    );
    assert_eq!(state.balance(wallet).expect("balance"), 4_000 + REWARD);
}
