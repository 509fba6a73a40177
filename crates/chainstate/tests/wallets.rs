mod common;

use common::*;
use ledgerd_chainstate::wallet::WalletRegistry;
use ledgerd_chainstate::ChainStateError;
use ledgerd_storage::WriteBatch;

#[test]
fn registering_funded_address_picks_up_its_outputs() {
    let linker = linker();
    let genesis = genesis("alice");
    linker.submit_block(genesis.clone()).expect("genesis");
    extend(&linker, genesis, 2, 1, "alice");

    let wallet = linker.create_wallet("savings").expect("wallet");
    assert_eq!(linker.state().balance(wallet).expect("balance"), 0);
    assert!(linker.register_address(wallet, "alice", false).expect("register"));
    assert_eq!(linker.state().balance(wallet).expect("balance"), 3 * REWARD);

    // Registering again is a no-op.
    assert!(!linker.register_address(wallet, "alice", false).expect("again"));
    assert_eq!(linker.state().balance(wallet).expect("balance"), 3 * REWARD);

    let addresses = linker.state().wallet_addresses(wallet).expect("addresses");
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].address, "alice");
    assert!(!addresses[0].is_change);
}

#[test]
fn address_ownership_rules() {
    let linker = linker();
    let first = linker.create_wallet("first").expect("wallet");
    let second = linker.create_wallet("second").expect("wallet");
    assert_ne!(first, second);
    linker.register_address(first, "shared", false).expect("register");

    match linker.register_address(second, "shared", true) {
        Err(ChainStateError::AddressInUse { address, wallet }) => {
            assert_eq!(address, "shared");
            assert_eq!(wallet, first);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(matches!(
        linker.register_address(second, "has space", false),
        Err(ChainStateError::InvalidAddress(_))
    ));
    assert!(matches!(
        linker.register_address(second, "", false),
        Err(ChainStateError::InvalidAddress(_))
    ));
    assert!(matches!(
        linker.register_address(999, "other", false),
        Err(ChainStateError::UnknownWallet(999))
    ));
    assert!(matches!(
        linker.state().balance(999),
        Err(ChainStateError::UnknownWallet(999))
    ));

    let names: Vec<_> = linker
        .state()
        .wallets()
        .expect("wallets")
        .into_iter()
        .map(|wallet| wallet.name)
        .collect();
    assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn listed_utxos_report_maturity_and_order() {
    let mut params = regtest();
    params.coinbase_maturity = 2;
    let linker = linker_with(params);
    let wallet = linker.create_wallet("alice").expect("wallet");
    linker.register_address(wallet, "alice", false).expect("register");

    let genesis = genesis("alice");
    linker.submit_block(genesis.clone()).expect("genesis");
    let block1 = simple_block(genesis.hash(), 1, 1, "alice");
    linker.submit_block(block1.clone()).expect("block 1");

    let utxos = linker.state().list_utxos(wallet).expect("utxos");
    assert_eq!(utxos.len(), 2);
    assert_eq!(utxos[0].outpoint, coinbase_outpoint(&genesis));
    assert!(utxos[0].mature);
    assert_eq!(utxos[0].confirmations, 2);
    assert_eq!(utxos[1].outpoint, coinbase_outpoint(&block1));
    assert!(!utxos[1].mature);
    assert_eq!(utxos[1].confirmations, 1);
    assert!(utxos.iter().all(|utxo| utxo.is_coinbase));
}

#[test]
fn history_nets_spends_against_change() {
    let linker = linker();
    let wallet = linker.create_wallet("alice").expect("wallet");
    linker.register_address(wallet, "alice", false).expect("register");
    linker.register_address(wallet, "alice-change", true).expect("register");

    let genesis = genesis("alice");
    linker.submit_block(genesis.clone()).expect("genesis");
    let payment = spend(
        &[coinbase_outpoint(&genesis)],
        &[("bob", 1_000), ("alice-change", 3_950)],
        50,
    );
    let block1 = block_with(
        genesis.hash(),
        1,
        1,
        0,
        vec![coinbase("miner", REWARD + 50, 1), payment.clone()],
    );
    linker.submit_block(block1).expect("block 1");

    let history = linker.state().wallet_history(wallet).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].txid, genesis.transactions[0].txid());
    assert_eq!(history[0].confirmations, 2);
    assert_eq!(history[1].txid, payment.txid());
    assert_eq!(history[1].height, Some(1));
    assert_eq!(history[1].delta, -1_050);
    assert_eq!(linker.state().balance(wallet).expect("balance"), 3_950);
}

#[test]
fn reconcile_repairs_stale_cache() {
    let linker = linker();
    let wallet = linker.create_wallet("alice").expect("wallet");
    linker.register_address(wallet, "alice", false).expect("register");
    let genesis = genesis("alice");
    linker.submit_block(genesis).expect("genesis");

    let state = linker.state();
    let mut batch = WriteBatch::new();
    WalletRegistry::new(state.store()).set_balance(&mut batch, wallet, 999);
    state.commit(&batch).expect("corrupt cache");
    assert_eq!(state.balance(wallet).expect("balance"), 999);

    let corrections = linker.reconcile().expect("reconcile");
    assert_eq!(corrections.len(), 1);
    assert_eq!(corrections[0].wallet, wallet);
    assert_eq!(corrections[0].cached, 999);
    assert_eq!(corrections[0].actual, REWARD);
    assert_eq!(state.balance(wallet).expect("balance"), REWARD);
    assert!(linker.reconcile().expect("clean").is_empty());
}

#[test]
fn negative_projection_triggers_reconcile() {
    let linker = linker();
    let wallet = linker.create_wallet("alice").expect("wallet");
    linker.register_address(wallet, "alice", false).expect("register");
    let genesis = genesis("alice");
    linker.submit_block(genesis.clone()).expect("genesis");
    let block1 = simple_block(genesis.hash(), 1, 1, "alice");
    linker.submit_block(block1.clone()).expect("block 1");

    let state = linker.state();
    let mut batch = WriteBatch::new();
    WalletRegistry::new(state.store()).set_balance(&mut batch, wallet, 100);
    state.commit(&batch).expect("corrupt cache");

    let block2 = block_with(
        block1.hash(),
        2,
        1,
        0,
        vec![
            coinbase("miner", REWARD, 2),
            spend(&[coinbase_outpoint(&genesis)], &[("bob", REWARD)], 0),
        ],
    );
    linker.submit_block(block2).expect("block 2");
    assert_eq!(state.balance(wallet).expect("balance"), REWARD);
}
